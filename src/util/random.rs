use rand::rngs::OsRng;
use rand::TryRngCore;
#[cfg(test)] use std::sync::Mutex;

use crate::probe::NodeId;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    /// a random (v4) UUID from the operating system's random source
    fn try_next_node_id() -> anyhow::Result<NodeId>;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn try_next_node_id() -> anyhow::Result<NodeId> {
        let mut bytes = [0u8; 16];
        OsRng.try_fill_bytes(&mut bytes)
            .map_err(|e| anyhow::anyhow!("operating system random source failed: {}", e))?;
        Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ids_are_v4_and_distinct() {
        let a = RngRandom::try_next_node_id().unwrap();
        let b = RngRandom::try_next_node_id().unwrap();
        assert_eq!(a.get_version_num(), 4);
        assert_ne!(a, b);
    }
}
