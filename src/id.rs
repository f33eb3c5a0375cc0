use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Create a random memory key.
///
/// Local and remote keys of the loopback provider come from here. Collisions are
/// resolved by the loopback provider, which draws again on a taken key.
pub(crate) fn random_key() -> u32 {
    rand::thread_rng().gen::<u32>()
}

/// Create the first endpoint number of a provider instance.
///
/// Mixes the sub-second clock with a random number so that two providers created in the
/// same process hand out distinguishable endpoint ids.
pub(crate) fn random_endpoint_base() -> u32 {
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since_the_epoch| since_the_epoch.subsec_micros());
    let rand = rand::thread_rng().gen::<u16>();
    // keep well below u32::MAX so that sequential allocation never wraps in practice
    (time.wrapping_shl(8) ^ u32::from(rand)) & 0x00ff_ffff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_base_leaves_headroom() {
        for _ in 0..64 {
            assert!(random_endpoint_base() <= 0x00ff_ffff);
        }
    }
}
