use rand_core::{impls, Error, RngCore, SeedableRng};

/// Wear-leveling generator. Allocation probes and superblock slot
/// selection only need spread, not security, so a 64-bit LCG is enough.
/// The seed comes from boot-time entropy supplied at mount.
pub struct Lcg {
    state: u64,
}

impl SeedableRng for Lcg {
    type Seed = [u8; 8];

    fn from_seed(seed: [u8; 8]) -> Lcg {
        // a zero state would short-cycle on some multipliers
        Lcg {
            state: u64::from_le_bytes(seed) | 1,
        }
    }
}

impl RngCore for Lcg {
    fn next_u32(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.state >> 33) as u32
    }

    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_u32(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl Lcg {
    /// Uniform-ish pick in `[0, n)`
    pub fn pick(&mut self, n: u16) -> u16 {
        debug_assert!(n > 0);
        (self.next_u32() % n as u32) as u16
    }
}

#[cfg(test)]
mod tests {
    use rand_core::SeedableRng;

    use super::Lcg;

    #[test]
    fn deterministic_per_seed() {
        let mut a = Lcg::seed_from_u64(42);
        let mut b = Lcg::seed_from_u64(42);
        for _ in 0..64 {
            assert_eq!(a.pick(4096), b.pick(4096));
        }
    }

    #[test]
    fn seeds_diverge() {
        let mut a = Lcg::seed_from_u64(1);
        let mut b = Lcg::seed_from_u64(2);
        let same = (0..64).filter(|_| a.pick(4096) == b.pick(4096)).count();
        assert!(same < 8);
    }

    #[test]
    fn spread() {
        let mut rng = Lcg::seed_from_u64(7);
        let mut hit = [false; 16];
        for _ in 0..256 {
            hit[rng.pick(16) as usize] = true;
        }
        assert!(hit.iter().all(|&h| h));
    }
}
