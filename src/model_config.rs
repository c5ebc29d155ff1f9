use std::path::{Path, PathBuf};

use log::debug;
use serde_yaml::{Mapping, Value};

use crate::errors::{DeepLabError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "deeplab_v3_plus_R_103_os16_mg124_poly_90k_bs16.yaml";

const BASE_KEY: &str = "_BASE_";
// Guards against `_BASE_` cycles.
const MAX_BASE_DEPTH: usize = 8;

/// Channel order the network expects its input tensor in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Nested key/value model configuration, addressed with dotted paths such as
/// `MODEL.SEM_SEG_HEAD.NORM`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    root: Value,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            root: Value::Mapping(Mapping::new()),
        }
    }
}

impl ModelConfig {
    /// Framework-wide defaults that a fresh config starts from.
    pub fn base() -> Self {
        let mut cfg = Self::default();
        cfg.set_default("MODEL.DEVICE", "cuda");
        cfg.set_default("MODEL.WEIGHTS", "");
        cfg.set_default("MODEL.META_ARCHITECTURE", "SemanticSegmentor");
        cfg.set_default("MODEL.RESNETS.NORM", "FrozenBN");
        cfg.set_default("MODEL.SEM_SEG_HEAD.NORM", "GN");
        cfg.set_default("MODEL.SEM_SEG_HEAD.NUM_CLASSES", 54);
        cfg.set_default("MODEL.SEM_SEG_HEAD.IGNORE_VALUE", 255);
        cfg.set_default("INPUT.FORMAT", "BGR");
        cfg
    }

    pub fn from_yaml_str(text: &str) -> std::result::Result<Self, serde_yaml::Error> {
        let root: Value = serde_yaml::from_str(text)?;
        Ok(Self {
            root: match root {
                Value::Null => Value::Mapping(Mapping::new()),
                other => other,
            },
        })
    }

    /// Read a config file, resolving `_BASE_` references relative to the
    /// file that names them.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut cfg = Self::default();
        cfg.merge_from_file(path)?;
        Ok(cfg)
    }

    /// Merge a config file over the current values.
    pub fn merge_from_file(&mut self, path: &Path) -> Result<()> {
        let loaded = load_with_bases(path, 0)?;
        merge_values(&mut self.root, loaded.root);
        Ok(())
    }

    /// Apply `KEY=VALUE` overrides. Values are parsed as YAML scalars or
    /// flow sequences, so `MODEL.PIXEL_MEAN=[1, 2, 3]` works.
    pub fn merge_from_list<S: AsRef<str>>(&mut self, overrides: &[S]) -> Result<()> {
        for item in overrides {
            let item = item.as_ref();
            let (key, raw) = item
                .split_once('=')
                .ok_or_else(|| DeepLabError::Validation {
                    field: "config override".to_string(),
                    reason: format!("expected KEY=VALUE, got `{item}`"),
                })?;
            let value: Value =
                serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            self.set(key.trim(), value);
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.root, |node, part| node.as_mapping()?.get(part))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set a value, creating intermediate sections as needed.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let mut node = &mut self.root;
        let mut parts = key.split('.').peekable();
        while let Some(part) = parts.next() {
            if !node.is_mapping() {
                *node = Value::Mapping(Mapping::new());
            }
            let Some(map) = node.as_mapping_mut() else {
                return;
            };
            if parts.peek().is_none() {
                map.insert(Value::from(part), value.into());
                return;
            }
            node = map
                .entry(Value::from(part))
                .or_insert_with(|| Value::Mapping(Mapping::new()));
        }
    }

    /// Set a value only if the key is absent.
    pub fn set_default(&mut self, key: &str, value: impl Into<Value>) {
        if !self.contains(key) {
            self.set(key, value);
        }
    }

    /// DeepLab-specific settings, filled in where the config leaves them out.
    pub fn apply_deeplab_defaults(&mut self) {
        self.set_default("INPUT.CROP.SINGLE_CATEGORY_MAX_AREA", 1.0);
        self.set_default("SOLVER.POLY_LR_POWER", 0.9);
        self.set_default("SOLVER.POLY_LR_CONSTANT_ENDING", 0.0);
        self.set_default("MODEL.SEM_SEG_HEAD.LOSS_TYPE", "hard_pixel_mining");
        self.set_default("MODEL.SEM_SEG_HEAD.PROJECT_FEATURES", vec!["res2"]);
        self.set_default("MODEL.SEM_SEG_HEAD.PROJECT_CHANNELS", vec![48]);
        self.set_default("MODEL.SEM_SEG_HEAD.ASPP_CHANNELS", 256);
        self.set_default("MODEL.SEM_SEG_HEAD.ASPP_DILATIONS", vec![6, 12, 18]);
        self.set_default("MODEL.SEM_SEG_HEAD.ASPP_DROPOUT", 0.1);
        self.set_default("MODEL.SEM_SEG_HEAD.USE_DEPTHWISE_SEPARABLE_CONV", false);
        self.set_default("MODEL.RESNETS.RES5_MULTI_GRID", vec![1, 2, 4]);
        self.set_default("MODEL.RESNETS.STEM_TYPE", "deeplab");
    }

    /// CPU execution cannot run synchronized batch norm, so swap it out
    /// together with the device.
    pub fn apply_cpu_overrides(&mut self) {
        self.set("MODEL.DEVICE", "cpu");
        self.set("MODEL.RESNETS.NORM", "BN");
        self.set("MODEL.SEM_SEG_HEAD.NORM", "BN");
    }

    pub fn is_cpu(&self) -> bool {
        self.get_str("MODEL.DEVICE")
            .is_some_and(|device| device.eq_ignore_ascii_case("cpu"))
    }

    pub fn weights(&self) -> Option<&str> {
        self.get_str("MODEL.WEIGHTS").filter(|w| !w.is_empty())
    }

    pub fn channel_order(&self) -> ChannelOrder {
        match self.get_str("INPUT.FORMAT") {
            Some(format) if format.eq_ignore_ascii_case("BGR") => ChannelOrder::Bgr,
            _ => ChannelOrder::Rgb,
        }
    }

    /// `CLASS_NAMES` as declared by a training run's config.
    pub fn class_names(&self) -> Option<Vec<String>> {
        self.get("CLASS_NAMES")?
            .as_sequence()?
            .iter()
            .map(|name| match name {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn set_class_names(&mut self, names: &[String]) {
        self.set("CLASS_NAMES", names.to_vec());
        self.set("MODEL.SEM_SEG_HEAD.NUM_CLASSES", names.len() as u64);
    }

    pub fn to_yaml_string(&self) -> std::result::Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.root)
    }
}

fn load_with_bases(path: &Path, depth: usize) -> Result<ModelConfig> {
    if depth > MAX_BASE_DEPTH {
        return Err(DeepLabError::config_load(
            path,
            "too many nested _BASE_ references",
        ));
    }

    let text = std::fs::read_to_string(path)
        .map_err(|e| DeepLabError::config_load(path, format!("cannot read file: {e}")))?;
    let mut cfg = ModelConfig::from_yaml_str(&text)
        .map_err(|e| DeepLabError::config_load(path, format!("invalid YAML: {e}")))?;
    if !cfg.root.is_mapping() {
        return Err(DeepLabError::config_load(
            path,
            "top level must be a mapping",
        ));
    }

    let base = match cfg.root.as_mapping_mut().and_then(|m| m.remove(BASE_KEY)) {
        Some(Value::String(base)) => base,
        Some(_) => {
            return Err(DeepLabError::config_load(path, "_BASE_ must be a string"));
        }
        None => return Ok(cfg),
    };

    let base_path = resolve_base(path, &base);
    debug!("{} inherits from {}", path.display(), base_path.display());
    let mut merged = load_with_bases(&base_path, depth + 1)?;
    merge_values(&mut merged.root, cfg.root);
    Ok(merged)
}

fn resolve_base(path: &Path, base: &str) -> PathBuf {
    let base = Path::new(base);
    if base.is_absolute() {
        return base.to_path_buf();
    }
    path.parent().unwrap_or(Path::new("")).join(base)
}

/// Recursive merge where `overlay` wins on scalar conflicts.
fn merge_values(target: &mut Value, overlay: Value) {
    match (target, overlay) {
        (Value::Mapping(target), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match target.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, overlay) => *target = overlay,
    }
}
