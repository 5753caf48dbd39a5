use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{info, warn};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use crate::models::cloud_instance::{CloudProviderKind, LaunchVm, VmConnection};
use crate::services::aws_service::AwsLauncher;

pub const SSH_PORT: u16 = 22;

/// Default number of SSH readiness probes after a launch. Attempts are one
/// second apart, so the default bounds the poll at about 40 seconds.
pub const DEFAULT_SSH_PORT_RETRIES: u32 = 40;

const PORT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// -----------------------------------------------------------------------------
// Launcher capability
// -----------------------------------------------------------------------------

/// VM lifecycle capability implemented once per supported cloud provider.
#[async_trait]
pub trait CloudProviderLauncher: Send + Sync {
    /// Launches a single VM instance and returns its connection details.
    /// On success the instance is running and has a public address.
    async fn launch_vm(&self, launch: &LaunchVm) -> Result<VmConnection>;

    /// Terminates an instance and removes every resource the launcher
    /// created for it (key pairs included). Deleting an instance that does
    /// not exist is an error, not a no-op.
    async fn delete_vm(&self, region: &str, instance_id: &str) -> Result<()>;
}

// -----------------------------------------------------------------------------
// Facade
// -----------------------------------------------------------------------------

/// Keyword facade for managing cloud resources from the test framework.
///
/// The launcher registry is populated at construction and never mutated
/// afterwards; provider names are resolved through [`CloudProviderKind`]
/// before any cloud call is made.
pub struct CloudProvider {
    launchers: HashMap<CloudProviderKind, Box<dyn CloudProviderLauncher>>,
    ssh_port_retries: u32,
}

impl CloudProvider {
    pub fn new() -> Self {
        let mut launchers: HashMap<CloudProviderKind, Box<dyn CloudProviderLauncher>> =
            HashMap::new();
        launchers.insert(CloudProviderKind::Aws, Box::new(AwsLauncher::new()));

        CloudProvider {
            launchers,
            ssh_port_retries: DEFAULT_SSH_PORT_RETRIES,
        }
    }

    /// Replaces (or adds) the launcher registered for `kind`.
    pub fn with_launcher(
        mut self,
        kind: CloudProviderKind,
        launcher: Box<dyn CloudProviderLauncher>,
    ) -> Self {
        self.launchers.insert(kind, launcher);
        self
    }

    pub fn with_ssh_port_retries(mut self, retries: u32) -> Self {
        self.ssh_port_retries = retries;
        self
    }

    fn launcher(&self, provider: &str) -> Result<&dyn CloudProviderLauncher> {
        let kind = CloudProviderKind::try_from(provider).map_err(|err| anyhow!(err))?;

        self.launchers
            .get(&kind)
            .map(|launcher| launcher.as_ref())
            .ok_or_else(|| anyhow!("Unsupported provider: {}", provider))
    }

    /// Launches a VM through the named provider, then probes its SSH port
    /// as a warm-up. The probe result is logged only; the launch result is
    /// returned whether or not the port ever opened.
    pub async fn launch_vm(&self, provider: &str, launch: &LaunchVm) -> Result<VmConnection> {
        let launcher = self.launcher(provider)?;
        let connection = launcher.launch_vm(launch).await?;

        if wait_for_port(&connection.public_host, SSH_PORT, self.ssh_port_retries).await {
            info!("SSH port open on {}", connection.public_host);
        } else {
            warn!(
                "SSH port on {} not open after {} attempts",
                connection.public_host, self.ssh_port_retries
            );
        }

        Ok(connection)
    }

    /// Deletes a VM through the named provider.
    pub async fn delete_vm(&self, provider: &str, region: &str, instance_id: &str) -> Result<()> {
        let launcher = self.launcher(provider)?;
        launcher.delete_vm(region, instance_id).await
    }
}

impl Default for CloudProvider {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// Functions
// -----------------------------------------------------------------------------

/// Probes `host:port` once per second until a TCP connect succeeds or
/// `retries` attempts are exhausted, giving a ceiling of roughly `retries`
/// seconds. Connection errors of any kind (refused, timeout, DNS failure)
/// count as "not open yet".
pub async fn wait_for_port(host: &str, port: u16, retries: u32) -> bool {
    for attempt in 0..retries {
        let started = Instant::now();

        match timeout(PORT_POLL_INTERVAL, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => return true,
            Ok(Err(_)) | Err(_) => {}
        }

        // Time spent connecting counts against the attempt interval, so
        // each failed attempt takes one interval in total
        if attempt + 1 < retries {
            if let Some(remaining) = PORT_POLL_INTERVAL.checked_sub(started.elapsed()) {
                sleep(remaining).await;
            }
        }
    }

    false
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    struct FakeLauncher {
        launches: Arc<AtomicUsize>,
        deletes: Arc<AtomicUsize>,
    }

    impl FakeLauncher {
        fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let launches = Arc::new(AtomicUsize::new(0));
            let deletes = Arc::new(AtomicUsize::new(0));
            let launcher = FakeLauncher {
                launches: launches.clone(),
                deletes: deletes.clone(),
            };
            (launcher, launches, deletes)
        }
    }

    #[async_trait]
    impl CloudProviderLauncher for FakeLauncher {
        async fn launch_vm(&self, _launch: &LaunchVm) -> Result<VmConnection> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(VmConnection {
                instance_id: "i-0123456789abcdef0".to_string(),
                public_host: "127.0.0.1".to_string(),
                ssh_username: "centos".to_string(),
                private_key_path: "/tmp/fake.pem".to_string(),
            })
        }

        async fn delete_vm(&self, _region: &str, _instance_id: &str) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn launch_request() -> LaunchVm {
        LaunchVm {
            region: "us-east-1".to_string(),
            security_group_id: "sg-1234".to_string(),
            subnet_id: "subnet-1234".to_string(),
            image_id: "ami-1234".to_string(),
            instance_type: "t2.nano".to_string(),
            instance_profile: "tortuga-test".to_string(),
            extra_tags: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_unknown_provider_fails_before_launch() {
        let (launcher, launches, _) = FakeLauncher::new();
        let provider = CloudProvider::new()
            .with_launcher(CloudProviderKind::Aws, Box::new(launcher))
            .with_ssh_port_retries(1);

        let err = provider
            .launch_vm("unknown-provider", &launch_request())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Unsupported provider"));
        assert_eq!(launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_launch_succeeds_even_if_port_never_opens() {
        let (launcher, launches, _) = FakeLauncher::new();
        let provider = CloudProvider::new()
            .with_launcher(CloudProviderKind::Aws, Box::new(launcher))
            .with_ssh_port_retries(1);

        let connection = provider
            .launch_vm("aws", &launch_request())
            .await
            .expect("launch should not depend on the readiness poll");

        assert_eq!(connection.instance_id, "i-0123456789abcdef0");
        assert_eq!(launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_delegates_to_launcher() {
        let (launcher, _, deletes) = FakeLauncher::new();
        let provider =
            CloudProvider::new().with_launcher(CloudProviderKind::Aws, Box::new(launcher));

        provider
            .delete_vm("aws", "us-east-1", "i-0123456789abcdef0")
            .await
            .unwrap();
        assert_eq!(deletes.load(Ordering::SeqCst), 1);

        let err = provider
            .delete_vm("azure", "eastus", "whatever")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported provider"));
    }

    #[tokio::test]
    async fn test_wait_for_port_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(wait_for_port("127.0.0.1", port, 3).await);
    }

    #[tokio::test]
    async fn test_wait_for_port_exhausts_retries() {
        // Bind then drop to find a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let started = Instant::now();
        assert!(!wait_for_port("127.0.0.1", port, 2).await);

        // Two refused attempts, one interval apart: at least one second,
        // and well under two intervals per attempt.
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
