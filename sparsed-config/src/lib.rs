// Submodules
pub mod error;
pub mod job;
pub mod kv;
pub mod stores;

pub use error::Error;
pub use job::{JobConfig, Role, SubCommand};
pub use kv::MiniConfig;
pub use stores::{FreqConfig, OlConfig, TsConfig};

/// Feature-kv export protocol versions understood by downstream serving.
pub const FEATURE_KV_PROTOCOL_VERSIONS: &[u32] = &[2, 3];

#[cfg(test)]
mod test {
    use crate::{JobConfig, FEATURE_KV_PROTOCOL_VERSIONS};

    #[test]
    fn test_default_config_serializable() {
        let config = JobConfig::default();
        toml::to_string(&config).unwrap();
    }

    #[test]
    fn test_default_config_round_trip() {
        let config = JobConfig::default();
        let s = toml::to_string(&config).unwrap();
        let back: JobConfig = toml::from_str(&s).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_known_protocol_versions() {
        assert!(FEATURE_KV_PROTOCOL_VERSIONS.contains(&2));
        assert!(!FEATURE_KV_PROTOCOL_VERSIONS.contains(&1));
    }
}
