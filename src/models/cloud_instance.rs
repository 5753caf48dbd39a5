use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// -----------------------------------------------------------------------------
// Models
// -----------------------------------------------------------------------------

/// Everything a launcher needs to bring up a single test VM.
///
/// `extra_tags` is the open bag of provider-specific extensions; they are
/// applied as additional instance tags on top of the ones the launcher sets
/// itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchVm {
    pub region: String,
    pub security_group_id: String,
    pub subnet_id: String,
    pub image_id: String,
    pub instance_type: String,
    pub instance_profile: String,
    #[serde(default)]
    pub extra_tags: HashMap<String, String>,
}

/// Connection details for a launched VM, handed back to the test script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConnection {
    pub instance_id: String,
    pub public_host: String,
    pub ssh_username: String,
    pub private_key_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudProviderKind {
    Aws,
}

impl CloudProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProviderKind::Aws => "aws",
        }
    }
}

impl TryFrom<&str> for CloudProviderKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "aws" => Ok(CloudProviderKind::Aws),
            _ => Err(format!("Unsupported provider: {}", value)),
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
