use image::Rgba;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Seed for the class color generator.
pub const DEFAULT_COLOR_SEED: u64 = 10;

pub const CITYSCAPES_CLASSES: [&str; 19] = [
    "road",
    "sidewalk",
    "building",
    "wall",
    "fence",
    "pole",
    "traffic light",
    "traffic sign",
    "vegetation",
    "terrain",
    "sky",
    "person",
    "rider",
    "car",
    "truck",
    "bus",
    "train",
    "motorcycle",
    "bicycle",
];

pub fn cityscapes_class_names() -> Vec<String> {
    CITYSCAPES_CLASSES.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassEntry {
    pub index: u16,
    pub name: String,
    pub color: Rgba<u8>,
}

/// Class names with their display colors, indexed by label value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassTable {
    entries: Vec<ClassEntry>,
}

impl ClassTable {
    /// Assign each class a color drawn from a PRNG seeded with `seed`, so
    /// tables with the same classes always render the same way.
    pub fn from_names<S: AsRef<str>>(names: &[S], seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let entries = names
            .iter()
            .enumerate()
            .map(|(index, name)| ClassEntry {
                index: index as u16,
                name: name.as_ref().to_string(),
                color: Rgba([rng.gen(), rng.gen(), rng.gen(), 255]),
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ClassEntry] {
        &self.entries
    }

    pub fn get(&self, label: u16) -> Option<&ClassEntry> {
        self.entries.get(label as usize)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colors_are_stable_for_seed() {
        let names = cityscapes_class_names();
        let first = ClassTable::from_names(&names, DEFAULT_COLOR_SEED);
        let second = ClassTable::from_names(&names, DEFAULT_COLOR_SEED);
        assert_eq!(first, second);
        assert_eq!(first.len(), 19);
        assert!(first.entries().iter().all(|e| e.color.0[3] == 255));
    }

    #[test]
    fn test_indices_follow_order() {
        let table = ClassTable::from_names(&["a", "b", "c"], 1);
        let indices: Vec<u16> = table.entries().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(table.get(1).map(|e| e.name.as_str()), Some("b"));
        assert!(table.get(3).is_none());
    }
}
