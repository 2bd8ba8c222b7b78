use crate::errors::ChuteError;
use crate::types::Chute;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod docker;
pub use docker::DockerRuntime;

/// Operations the update executor needs from a container runtime.
///
/// Every method resolves to success or a [`ChuteError`]; nothing here
/// is allowed to leave half-built runtime state behind on failure.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build the chute's image, create and start its container, then
    /// attach its network interfaces.  Build output lines are
    /// forwarded to `progress`.
    async fn build_and_start(
        &self,
        chute: &Chute,
        progress: mpsc::Sender<String>,
    ) -> Result<(), ChuteError>;

    /// Stop the chute's container.  Stopping a container that is
    /// already stopped is not an error.
    async fn stop(&self, chute: &Chute) -> Result<(), ChuteError>;

    /// Start the chute's existing container and re-attach its network
    /// interfaces.
    async fn restart(&self, chute: &Chute) -> Result<(), ChuteError>;

    /// Remove the chute's container and the image it was built from.
    async fn remove(&self, chute: &Chute) -> Result<(), ChuteError>;
}
