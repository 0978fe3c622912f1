//! 模型表：对外模型 id 到上游模型名/模式/配额池的静态映射。

use crate::token::types::{POOL_BASIC, POOL_SUPER};

pub const MODE_FAST: &str = "MODEL_MODE_FAST";
pub const MODE_AUTO: &str = "MODEL_MODE_AUTO";
pub const MODE_EXPERT: &str = "MODEL_MODE_EXPERT";

/// 配额查询使用的默认模型名。
pub const DEFAULT_RATE_LIMIT_MODEL: &str = "grok-4-1-thinking-1129";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Basic,
    Super,
}

#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    pub model_id: &'static str,
    pub upstream_model: &'static str,
    pub model_mode: &'static str,
    pub rate_limit_model: &'static str,
    pub tier: Tier,
    pub is_reasoning: bool,
}

impl ModelInfo {
    pub fn pool_name(&self) -> &'static str {
        match self.tier {
            Tier::Basic => POOL_BASIC,
            Tier::Super => POOL_SUPER,
        }
    }
}

const MODELS: &[ModelInfo] = &[
    ModelInfo {
        model_id: "grok-3",
        upstream_model: "grok-3",
        model_mode: MODE_FAST,
        rate_limit_model: "grok-3",
        tier: Tier::Basic,
        is_reasoning: false,
    },
    ModelInfo {
        model_id: "grok-4",
        upstream_model: "grok-4",
        model_mode: MODE_EXPERT,
        rate_limit_model: "grok-4",
        tier: Tier::Basic,
        is_reasoning: false,
    },
    ModelInfo {
        model_id: "grok-4-fast",
        upstream_model: "grok-4-fast",
        model_mode: MODE_FAST,
        rate_limit_model: "grok-4-fast",
        tier: Tier::Basic,
        is_reasoning: false,
    },
    ModelInfo {
        model_id: "grok-4-mini-thinking-tahoe",
        upstream_model: "grok-4-mini-thinking-tahoe",
        model_mode: MODE_AUTO,
        rate_limit_model: DEFAULT_RATE_LIMIT_MODEL,
        tier: Tier::Basic,
        is_reasoning: true,
    },
    ModelInfo {
        model_id: "grok-4-1-thinking-1129",
        upstream_model: "grok-4-1-thinking-1129",
        model_mode: MODE_AUTO,
        rate_limit_model: DEFAULT_RATE_LIMIT_MODEL,
        tier: Tier::Basic,
        is_reasoning: true,
    },
    ModelInfo {
        model_id: "grok-4.2",
        upstream_model: "grok-4.2",
        model_mode: MODE_AUTO,
        rate_limit_model: "grok-4.2",
        tier: Tier::Basic,
        is_reasoning: false,
    },
    ModelInfo {
        model_id: "grok-4-heavy",
        upstream_model: "grok-4-heavy",
        model_mode: MODE_EXPERT,
        rate_limit_model: "grok-4-heavy",
        tier: Tier::Super,
        is_reasoning: false,
    },
];

/// 历史别名 -> 规范模型 id。
const ALIASES: &[(&str, &str)] = &[("grok-420", "grok-4.2"), ("grok-3-fast", "grok-3")];

pub struct ModelService;

impl ModelService {
    pub fn get(model_id: &str) -> Option<&'static ModelInfo> {
        let id = model_id.trim();
        let canonical = ALIASES
            .iter()
            .find(|(alias, _)| *alias == id)
            .map(|(_, target)| *target)
            .unwrap_or(id);
        MODELS.iter().find(|m| m.model_id == canonical)
    }

    pub fn valid(model_id: &str) -> bool {
        Self::get(model_id).is_some()
    }

    pub fn list() -> &'static [ModelInfo] {
        MODELS
    }

    pub fn pool_for(model_id: &str) -> &'static str {
        Self::get(model_id)
            .map(|m| m.pool_name())
            .unwrap_or(POOL_BASIC)
    }

    pub fn rate_limit_model_for(model_id: &str) -> &'static str {
        Self::get(model_id)
            .map(|m| m.rate_limit_model)
            .unwrap_or(DEFAULT_RATE_LIMIT_MODEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_resolves_to_canonical_model() {
        let canonical = ModelService::get("grok-4.2").unwrap();
        let alias = ModelService::get("grok-420").unwrap();
        assert_eq!(canonical.model_id, "grok-4.2");
        assert_eq!(alias.model_id, "grok-4.2");
        assert_eq!(alias.model_mode, MODE_AUTO);
        assert_eq!(ModelService::rate_limit_model_for("grok-420"), "grok-4.2");
    }

    #[test]
    fn unknown_model_is_invalid() {
        assert!(!ModelService::valid("grok-99"));
        assert!(ModelService::get("grok-99").is_none());
    }

    #[test]
    fn heavy_model_routes_to_super_pool() {
        assert_eq!(ModelService::pool_for("grok-4-heavy"), POOL_SUPER);
        assert_eq!(ModelService::pool_for("grok-3"), POOL_BASIC);
    }
}
