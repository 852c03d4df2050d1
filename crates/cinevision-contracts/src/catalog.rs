use indexmap::IndexMap;

use crate::artifacts::Pipeline;

/// Identifier of the default image synthesis model.
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-3-pro-image-preview";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageModelSpec {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterEntry {
    pub id: String,
    pub name: String,
    pub default_pipeline: Option<Pipeline>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FranchiseEntry {
    pub id: String,
    pub name: String,
    pub characters: Vec<CharacterEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    pub id: Pipeline,
    pub name: &'static str,
    pub description: &'static str,
}

pub fn pipeline_specs() -> [PipelineSpec; 3] {
    Pipeline::ALL.map(|id| PipelineSpec {
        id,
        name: id.title(),
        description: id.description(),
    })
}

/// Reference catalog of franchises and their characters, insertion-ordered.
#[derive(Debug, Clone)]
pub struct FranchiseCatalog {
    franchises: IndexMap<String, FranchiseEntry>,
}

impl FranchiseCatalog {
    pub fn new(franchises: Option<IndexMap<String, FranchiseEntry>>) -> Self {
        Self {
            franchises: franchises.unwrap_or_else(default_franchises),
        }
    }

    pub fn get(&self, id: &str) -> Option<&FranchiseEntry> {
        self.franchises.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &FranchiseEntry> {
        self.franchises.values()
    }

    pub fn find_character(&self, franchise_id: &str, character_id: &str) -> Option<&CharacterEntry> {
        self.get(franchise_id)?
            .characters
            .iter()
            .find(|character| character.id == character_id)
    }
}

impl Default for FranchiseCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

pub fn image_models() -> IndexMap<String, ImageModelSpec> {
    let mut map = IndexMap::new();
    map.insert(
        DEFAULT_IMAGE_MODEL.to_string(),
        ImageModelSpec {
            id: DEFAULT_IMAGE_MODEL.to_string(),
            name: "Gemini 3 Pro (Cinema)".to_string(),
            description: "High fidelity, superior lighting & coherence. 4K+ resolution."
                .to_string(),
        },
    );
    map
}

fn default_franchises() -> IndexMap<String, FranchiseEntry> {
    let mut map = IndexMap::new();

    let mut insert = |id: &str, name: &str, characters: &[(&str, &str, Option<Pipeline>)]| {
        map.insert(
            id.to_string(),
            FranchiseEntry {
                id: id.to_string(),
                name: name.to_string(),
                characters: characters
                    .iter()
                    .map(|(char_id, char_name, default_pipeline)| CharacterEntry {
                        id: (*char_id).to_string(),
                        name: (*char_name).to_string(),
                        default_pipeline: *default_pipeline,
                    })
                    .collect(),
            },
        );
    };

    insert(
        "naruto",
        "火影忍者 (Naruto)",
        &[
            ("naruto_uzumaki", "Uzumaki Naruto (漩涡鸣人)", Some(Pipeline::B)),
            ("sasuke_uchiha", "Uchiha Sasuke (宇智波佐助)", Some(Pipeline::C)),
            ("itachi_uchiha", "Uchiha Itachi (宇智波鼬)", Some(Pipeline::A)),
            ("kakashi_hatake", "Hatake Kakashi (旗木卡卡西)", Some(Pipeline::A)),
            ("sakura_haruno", "Haruno Sakura (春野樱)", Some(Pipeline::B)),
            ("madara_uchiha", "Uchiha Madara (宇智波斑)", Some(Pipeline::C)),
            ("gaara", "Gaara (我爱罗)", Some(Pipeline::C)),
            ("rock_lee", "Rock Lee (洛克李)", Some(Pipeline::B)),
            ("hinata_hyuga", "Hyuga Hinata (日向雏田)", Some(Pipeline::A)),
            ("kurama", "Kurama (九喇嘛/九尾)", Some(Pipeline::C)),
        ],
    );

    insert(
        "one_piece",
        "海贼王 (One Piece)",
        &[
            ("monkey_d_luffy", "Monkey D. Luffy (路飞)", Some(Pipeline::B)),
            ("roronoa_zoro", "Roronoa Zoro (索隆)", Some(Pipeline::B)),
            ("nami", "Nami (娜美)", Some(Pipeline::A)),
            ("sanji", "Sanji (山治)", Some(Pipeline::B)),
            ("nico_robin", "Nico Robin (妮可·罗宾)", Some(Pipeline::A)),
            ("shanks", "Shanks (香克斯)", Some(Pipeline::C)),
            ("kaido", "Kaido (凯多)", Some(Pipeline::C)),
        ],
    );

    insert(
        "digimon",
        "数码宝贝 (Digimon)",
        &[
            ("agumon", "Agumon (亚古兽)", Some(Pipeline::B)),
            ("wargreymon", "WarGreymon (战斗暴龙兽)", Some(Pipeline::B)),
            ("metalgarurumon", "MetalGarurumon (钢铁加鲁鲁兽)", Some(Pipeline::C)),
            ("omegamon", "Omegamon (奥米加兽)", Some(Pipeline::C)),
            ("angewomon", "Angewomon (天女兽)", Some(Pipeline::A)),
        ],
    );

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup_by_franchise_and_character() {
        let catalog = FranchiseCatalog::default();
        let naruto = catalog.get("naruto").expect("missing franchise");
        assert_eq!(naruto.name, "火影忍者 (Naruto)");

        let character = catalog
            .find_character("naruto", "naruto_uzumaki")
            .expect("missing character");
        assert_eq!(character.default_pipeline, Some(Pipeline::B));
    }

    #[test]
    fn catalog_preserves_insertion_order() {
        let catalog = FranchiseCatalog::default();
        let ids: Vec<&str> = catalog.list().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids[0], "naruto");
    }

    #[test]
    fn pipeline_specs_cover_all_pipelines() {
        let specs = pipeline_specs();
        assert_eq!(specs.len(), 3);
        assert!(specs[0].name.contains("Static Truth"));
        assert!(specs[1].name.contains("Kinetic Burst"));
        assert!(specs[2].name.contains("Resonance Aftermath"));
    }

    #[test]
    fn default_model_is_registered() {
        assert!(image_models().contains_key(DEFAULT_IMAGE_MODEL));
    }
}
