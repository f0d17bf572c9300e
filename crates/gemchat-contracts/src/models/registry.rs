use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }

    pub fn supports_all(&self, capabilities: &[&str]) -> bool {
        capabilities.iter().all(|capability| self.supports(capability))
    }
}

/// Known chat models, in preference order.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capabilities(&self, capabilities: &[&str]) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports_all(capabilities))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capabilities: &[&str]) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports_all(capabilities) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, capabilities: &[&str], context_window: Option<u64>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: "gemini".to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                context_window,
            },
        );
    };

    insert("gemini-exp-1206", &["text", "image"], Some(2_097_152));
    insert("gemini-2.0-flash-exp", &["text", "image"], Some(1_048_576));
    insert("gemini-1.5-pro", &["text", "image", "video"], Some(2_097_152));

    map
}
