use serde::{Deserialize, Serialize};

/// Bounds on how many runners of a [`VmType`] should exist at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantity {
    pub min: u32,
    pub max: u32,
}

/// Cloud-specific parameters needed to spawn a VM for this pool.
///
/// This is the concrete shape of the "opaque config map" the spec describes;
/// the OpenStack `CloudClient` is the only consumer that interprets these fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudConfig {
    pub image: String,
    pub flavor: String,
    pub network: String,
    pub key_name: String,
    #[serde(default = "default_runner_user")]
    pub runner_user: String,
    #[serde(default = "default_runner_group")]
    pub runner_group: String,
}

fn default_runner_user() -> String {
    "runner".to_string()
}

fn default_runner_group() -> String {
    "runner".to_string()
}

/// A declarative description of a pool of runners: the labels they register
/// under, the VM they're spawned from, and how many should be kept around.
///
/// Immutable after construction. Two `VmType`s are equal iff their sorted tag
/// sequences match -- the config and quantity play no part in identity, since
/// a single logical pool's config can legitimately change between ticks
/// without runners needing to treat it as a different pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmType {
    tags: Vec<String>,
    pub config: CloudConfig,
    pub quantity: Quantity,
}

impl VmType {
    pub fn new(mut tags: Vec<String>, config: CloudConfig, quantity: Quantity) -> Self {
        tags.sort();
        Self {
            tags,
            config,
            quantity,
        }
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }
}

impl PartialEq for VmType {
    fn eq(&self, other: &Self) -> bool {
        self.tags == other.tags
    }
}

impl Eq for VmType {}

impl std::fmt::Display for VmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}:{}", self.tags, self.config.image, self.config.flavor)
    }
}
