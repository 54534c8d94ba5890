use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "RoutingConfig::default_threshold")]
    pub rule_threshold: f64,
    #[serde(default = "RoutingConfig::default_agent")]
    pub default_agent: String,
    #[serde(default = "RoutingConfig::default_context_turns")]
    pub context_turns: usize,
}

impl RoutingConfig {
    fn default_threshold() -> f64 { 0.7 }
    fn default_agent() -> String { "general-analysis".into() }
    fn default_context_turns() -> usize { 3 }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            rule_threshold: 0.7,
            default_agent: "general-analysis".into(),
            context_turns: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "GatewayConfig::default_base")]
    pub base_url: String,
    #[serde(default = "GatewayConfig::default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "GatewayConfig::default_max_tokens")]
    pub max_output_tokens: u32,
}

impl GatewayConfig {
    fn default_base() -> String { "http://127.0.0.1:8700".into() }
    fn default_timeout() -> u64 { 30 }
    fn default_max_tokens() -> u32 { 1200 }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base(),
            timeout_secs: 30,
            max_output_tokens: 1200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default = "SystemConfig::default_packs_dir")]
    pub packs_dir: String,
    #[serde(default)]
    pub catalog_path: Option<String>,
    pub version: String,
}

impl SystemConfig {
    fn default_packs_dir() -> String { "./packs".into() }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            gateway: GatewayConfig::default(),
            packs_dir: "./packs".into(),
            catalog_path: None,
            version: "1.0".to_string(),
        }
    }
}

impl SystemConfig {
    pub fn load(path: &str) -> Result<Self, String> {
        if !Path::new(path).exists() {
            return Ok(Self::default());
        }
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Self>(&content) {
                Ok(config) => Ok(config),
                Err(e) => Err(format!("解析配置文件失败: {}", e)),
            },
            Err(e) => Err(format!("读取配置文件失败: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_default() {
        let config = SystemConfig::load("/nonexistent/rift_coach.json").unwrap();
        assert_eq!(config.routing.rule_threshold, 0.7);
        assert_eq!(config.routing.default_agent, "general-analysis");
        assert_eq!(config.routing.context_turns, 3);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: SystemConfig =
            serde_json::from_str(r#"{"version":"1.0","routing":{"rule_threshold":0.8}}"#).unwrap();
        assert_eq!(config.routing.rule_threshold, 0.8);
        assert_eq!(config.routing.default_agent, "general-analysis");
        assert_eq!(config.gateway.timeout_secs, 30);
        assert_eq!(config.packs_dir, "./packs");
    }
}
