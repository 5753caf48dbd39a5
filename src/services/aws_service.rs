use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use log::{debug, info};
use rusoto_core::HttpClient;
use rusoto_credential::EnvironmentProvider;
use rusoto_ec2::{
    CreateKeyPairRequest, DeleteKeyPairRequest, DescribeInstancesRequest, Ec2, Ec2Client,
    IamInstanceProfileSpecification, Instance, RunInstancesRequest, Tag, TagSpecification,
    TerminateInstancesRequest,
};
use rusoto_signature::Region;
use tokio::time::sleep;

use crate::cloud_provider::CloudProviderLauncher;
use crate::models::cloud_instance::{LaunchVm, VmConnection};
use crate::util::generators::generate_run_identifier;

/// Login user baked into the CentOS images the test suites launch.
const SSH_USERNAME: &str = "centos";

/// Tag linking an instance back to the key pair created for it. This tag is
/// the only record of that association, so deletion depends on it.
const KEY_PAIR_TAG: &str = "KeyPair";

// -----------------------------------------------------------------------------
// Launcher
// -----------------------------------------------------------------------------

/// EC2 implementation of the VM lifecycle capability.
pub struct AwsLauncher {
    state_wait_attempts: u32,
    state_wait_delay: Duration,
}

impl AwsLauncher {
    /// Defaults mirror the SDK waiter: 40 describe attempts, 15 seconds
    /// apart, for both the running and the terminated transitions.
    pub fn new() -> Self {
        AwsLauncher {
            state_wait_attempts: 40,
            state_wait_delay: Duration::from_secs(15),
        }
    }

    pub fn with_state_wait(mut self, attempts: u32, delay: Duration) -> Self {
        self.state_wait_attempts = attempts;
        self.state_wait_delay = delay;
        self
    }

    /// Polls describe-instances until the instance reports `target_state`.
    /// Transient describe errors count as "not there yet".
    async fn wait_for_instance_state(
        &self,
        ec2_client: &Ec2Client,
        instance_id: &str,
        target_state: &str,
    ) -> Result<()> {
        for _ in 0..self.state_wait_attempts {
            if let Ok(instance) = describe_instance(ec2_client, instance_id).await {
                let state = instance
                    .state
                    .and_then(|state| state.name)
                    .unwrap_or_default();
                debug!("Instance {} state: {}", instance_id, state);

                if state == target_state {
                    return Ok(());
                }
            }

            sleep(self.state_wait_delay).await;
        }

        bail!(
            "Timed out waiting for instance {} to be {}",
            instance_id,
            target_state
        );
    }
}

impl Default for AwsLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudProviderLauncher for AwsLauncher {
    async fn launch_vm(&self, launch: &LaunchVm) -> Result<VmConnection> {
        // One identifier names the instance and its key pair
        let identifier = generate_run_identifier();
        let ec2_client = ec2_client(&launch.region)?;

        let private_key_path = create_key_pair(&ec2_client, &identifier).await?;

        let run_instances_req = create_instance_request(&identifier, launch);
        let reservation = ec2_client
            .run_instances(run_instances_req)
            .await
            .map_err(|err| anyhow!("Error launching instance: {:?}", err))?;

        let instance_id = reservation
            .instances
            .as_ref()
            .and_then(|instances| instances.first())
            .and_then(|instance| instance.instance_id.clone())
            .ok_or_else(|| anyhow!("Instance ID not found"))?;
        info!("Launched instance {} as {}", instance_id, identifier);

        self.wait_for_instance_state(&ec2_client, &instance_id, "running")
            .await?;

        // Re-describe the instance so the public hostname and other data
        // populated after the running transition is available
        let instance = describe_instance(&ec2_client, &instance_id).await?;
        let public_host = instance
            .public_dns_name
            .filter(|host| !host.is_empty())
            .or(instance.public_ip_address)
            .ok_or_else(|| anyhow!("Instance {} has no public address", instance_id))?;

        Ok(VmConnection {
            instance_id,
            public_host,
            ssh_username: SSH_USERNAME.to_string(),
            private_key_path,
        })
    }

    async fn delete_vm(&self, region: &str, instance_id: &str) -> Result<()> {
        let ec2_client = ec2_client(region)?;

        let instance = describe_instance(&ec2_client, instance_id).await?;

        // The KeyPair tag is absent on instances created outside this
        // library; skip key cleanup for those
        let key_pair_name = find_key_pair_tag(instance.tags.as_deref().unwrap_or(&[]));

        let terminate_req = TerminateInstancesRequest {
            instance_ids: vec![instance_id.to_string()],
            ..Default::default()
        };
        ec2_client
            .terminate_instances(terminate_req)
            .await
            .map_err(|err| anyhow!("Error terminating instance: {:?}", err))?;

        self.wait_for_instance_state(&ec2_client, instance_id, "terminated")
            .await?;
        info!("Terminated instance {}", instance_id);

        if let Some(key_pair_name) = key_pair_name {
            delete_key_pair(&ec2_client, &key_pair_name).await?;
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Functions
// -----------------------------------------------------------------------------

fn ec2_client(region: &str) -> Result<Ec2Client> {
    dotenvy::dotenv().ok();

    let region = region
        .parse::<Region>()
        .map_err(|err| anyhow!("Invalid region {}: {}", region, err))?;
    let http_client =
        HttpClient::new().map_err(|err| anyhow!("Failed to create HTTP client: {}", err))?;

    Ok(Ec2Client::new_with(
        http_client,
        EnvironmentProvider::default(),
        region,
    ))
}

/// Predictable location of the private key written for a key pair.
fn private_key_path(key_pair_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}.pem", key_pair_name))
}

/// Creates a key pair and writes the private key to the filesystem,
/// returning its path.
async fn create_key_pair(ec2_client: &Ec2Client, key_pair_name: &str) -> Result<String> {
    let create_req = CreateKeyPairRequest {
        key_name: key_pair_name.to_string(),
        ..Default::default()
    };

    let key_pair = ec2_client
        .create_key_pair(create_req)
        .await
        .map_err(|err| anyhow!("Error creating key pair: {:?}", err))?;
    let key_material = key_pair
        .key_material
        .ok_or_else(|| anyhow!("Key material not returned for {}", key_pair_name))?;

    let path = private_key_path(key_pair_name);
    tokio::fs::write(&path, key_material)
        .await
        .map_err(|err| anyhow!("Error writing private key {}: {}", path.display(), err))?;

    Ok(path.to_string_lossy().into_owned())
}

async fn delete_key_pair(ec2_client: &Ec2Client, key_pair_name: &str) -> Result<()> {
    let delete_req = DeleteKeyPairRequest {
        key_name: Some(key_pair_name.to_string()),
        ..Default::default()
    };

    ec2_client
        .delete_key_pair(delete_req)
        .await
        .map_err(|err| anyhow!("Error deleting key pair {}: {:?}", key_pair_name, err))?;

    Ok(())
}

/// Builds the run-instances request for exactly one instance, tagged with
/// `Name` and `KeyPair` set to the run identifier.
fn create_instance_request(identifier: &str, launch: &LaunchVm) -> RunInstancesRequest {
    let mut tags = HashMap::new();
    tags.insert("Name".to_string(), identifier.to_string());
    tags.insert(KEY_PAIR_TAG.to_string(), identifier.to_string());
    tags.extend(launch.extra_tags.clone());

    RunInstancesRequest {
        iam_instance_profile: Some(IamInstanceProfileSpecification {
            name: Some(launch.instance_profile.clone()),
            ..Default::default()
        }),
        image_id: Some(launch.image_id.clone()),
        instance_type: Some(launch.instance_type.clone()),
        min_count: 1,
        max_count: 1,
        key_name: Some(identifier.to_string()),
        tag_specifications: Some(vec![TagSpecification {
            resource_type: Some("instance".to_string()),
            tags: Some(
                tags.iter()
                    .map(|(key, value)| Tag {
                        key: Some(key.to_string()),
                        value: Some(value.to_string()),
                    })
                    .collect(),
            ),
        }]),
        subnet_id: Some(launch.subnet_id.clone()),
        security_group_ids: Some(vec![launch.security_group_id.clone()]),
        ..Default::default()
    }
}

async fn describe_instance(ec2_client: &Ec2Client, instance_id: &str) -> Result<Instance> {
    let describe_req = DescribeInstancesRequest {
        instance_ids: Some(vec![instance_id.to_string()]),
        ..Default::default()
    };

    let response = ec2_client
        .describe_instances(describe_req)
        .await
        .map_err(|err| anyhow!("Error describing instance {}: {:?}", instance_id, err))?;

    response
        .reservations
        .and_then(|reservations| reservations.into_iter().next())
        .and_then(|reservation| reservation.instances)
        .and_then(|instances| instances.into_iter().next())
        .ok_or_else(|| anyhow!("Instance not found: {}", instance_id))
}

fn find_key_pair_tag(tags: &[Tag]) -> Option<String> {
    tags.iter()
        .find(|tag| tag.key.as_deref() == Some(KEY_PAIR_TAG))
        .and_then(|tag| tag.value.clone())
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cloud_instance::LaunchVm;

    fn launch_request() -> LaunchVm {
        let mut extra_tags = HashMap::new();
        extra_tags.insert("Suite".to_string(), "auth".to_string());

        LaunchVm {
            region: "us-east-1".to_string(),
            security_group_id: "sg-0123".to_string(),
            subnet_id: "subnet-0123".to_string(),
            image_id: "ami-0123".to_string(),
            instance_type: "t2.nano".to_string(),
            instance_profile: "tortuga-test".to_string(),
            extra_tags,
        }
    }

    fn tag_value(tags: &[Tag], key: &str) -> Option<String> {
        tags.iter()
            .find(|tag| tag.key.as_deref() == Some(key))
            .and_then(|tag| tag.value.clone())
    }

    #[test]
    fn test_create_instance_request_single_tagged_instance() {
        let identifier = "tortuga-test-lib-0000";
        let request = create_instance_request(identifier, &launch_request());

        assert_eq!(request.min_count, 1);
        assert_eq!(request.max_count, 1);
        assert_eq!(request.key_name.as_deref(), Some(identifier));
        assert_eq!(request.image_id.as_deref(), Some("ami-0123"));
        assert_eq!(request.subnet_id.as_deref(), Some("subnet-0123"));
        assert_eq!(
            request.security_group_ids,
            Some(vec!["sg-0123".to_string()])
        );
        assert_eq!(
            request
                .iam_instance_profile
                .as_ref()
                .and_then(|profile| profile.name.as_deref()),
            Some("tortuga-test")
        );

        let specs = request.tag_specifications.unwrap();
        let tags = specs[0].tags.as_ref().unwrap();
        assert_eq!(tag_value(tags, "Name").as_deref(), Some(identifier));
        assert_eq!(tag_value(tags, "KeyPair").as_deref(), Some(identifier));
        assert_eq!(tag_value(tags, "Suite").as_deref(), Some("auth"));
    }

    #[test]
    fn test_find_key_pair_tag() {
        let tags = vec![
            Tag {
                key: Some("Name".to_string()),
                value: Some("tortuga-test-lib-0000".to_string()),
            },
            Tag {
                key: Some("KeyPair".to_string()),
                value: Some("tortuga-test-lib-0000".to_string()),
            },
        ];

        assert_eq!(
            find_key_pair_tag(&tags).as_deref(),
            Some("tortuga-test-lib-0000")
        );
        assert_eq!(find_key_pair_tag(&tags[..1]), None);
    }

    #[test]
    fn test_private_key_path_embeds_identifier() {
        let path = private_key_path("tortuga-test-lib-0000");

        assert!(path.starts_with(std::env::temp_dir()));
        assert!(path
            .to_string_lossy()
            .ends_with("tortuga-test-lib-0000.pem"));
    }

    // Runs against a real account; needs AWS credentials plus the
    // TORTUGA_TEST_* variables in the environment.
    #[tokio::test]
    #[ignore]
    async fn test_launch_and_delete_vm() {
        let _ = env_logger::builder().is_test(true).try_init();

        let launch = LaunchVm {
            region: dotenvy::var("TORTUGA_TEST_REGION").unwrap(),
            security_group_id: dotenvy::var("TORTUGA_TEST_SECURITY_GROUP").unwrap(),
            subnet_id: dotenvy::var("TORTUGA_TEST_SUBNET").unwrap(),
            image_id: dotenvy::var("TORTUGA_TEST_AMI").unwrap(),
            instance_type: "t2.nano".to_string(),
            instance_profile: dotenvy::var("TORTUGA_TEST_INSTANCE_PROFILE").unwrap(),
            extra_tags: Default::default(),
        };

        let launcher = AwsLauncher::new();
        let connection = launcher
            .launch_vm(&launch)
            .await
            .expect("Failed to launch instance");

        assert!(connection.instance_id.starts_with("i-"));
        assert!(!connection.public_host.is_empty());
        assert_eq!(connection.ssh_username, "centos");

        launcher
            .delete_vm(&launch.region, &connection.instance_id)
            .await
            .expect("Failed to delete instance");
    }
}
