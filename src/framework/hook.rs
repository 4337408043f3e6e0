use super::query::BundleInfo;

/// Host-specific activation. Turning bundle content into running code is
/// outside the framework; it calls this when a bundle starts or stops.
pub trait ActivationHook: Send + Sync {
    fn start(&self, bundle: &BundleInfo) -> anyhow::Result<()>;

    fn stop(&self, _bundle: &BundleInfo) -> anyhow::Result<()> {
        Ok(())
    }
}
