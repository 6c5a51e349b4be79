//! A test-only policy offering a randomly chosen, non-empty subset of the
//! usable (present and not debug-masked) cores. It moves on to a new subset each time the hardware has
//! settled on the current one, which keeps core power sequencing busy.
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::helpe::*;

#[derive(Debug)]
pub struct RandomPolicy {
    name: &'static str,
    // `None` seeds from OS entropy.
    seed: Option<u64>,
}

/// The registry's random policy.
pub static RANDOM: RandomPolicy = RandomPolicy::new("random");

#[derive(Debug)]
pub struct RandomData {
    rng:        StdRng,
    current:    CoreMask,
    picks:      u64,
}

impl RandomData {
    pub fn current(&self) -> CoreMask {
        self.current
    }

    /// How many subsets have been offered so far.
    pub fn picks(&self) -> u64 {
        self.picks
    }
}

impl RandomPolicy {
    pub const fn new(name: &'static str) -> Self {
        Self { name, seed: None }
    }

    /// Reproducible choices, for tests.
    pub const fn seeded(name: &'static str, seed: u64) -> Self {
        Self { name, seed: Some(seed) }
    }
}

/// Bounded: never loops, and never empty while `usable` isn't.
#[inline(always)]
fn pick(rng: &mut StdRng, usable: CoreMask) -> CoreMask {
    let cand = rng.gen::<CoreMask>() & usable;
    if cand != 0 {
        cand
    } else {
        // Lowest usable core.
        usable & usable.wrapping_neg()
    }
}

fn data_of(data: &PolicyData) -> &RandomData {
    match data {
        PolicyData::Random(d) => d,
        other => panic!("Random policy handed foreign state: {:?}", other),
    }
}

fn data_of_mut(data: &mut PolicyData) -> &mut RandomData {
    match data {
        PolicyData::Random(d) => d,
        other => panic!("Random policy handed foreign state: {:?}", other),
    }
}

impl CaPolicy for RandomPolicy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn id(&self) -> PolicyId {
        PolicyId::Random
    }

    fn init(&self, dev: &Device) -> Result<PolicyData, PmError> {
        might_sleep();
        let usable = dev.pm.power_change().masks().permissive();
        if usable == 0 {
            return Err(PmError::PolicyInit {
                policy: self.name,
                reason: String::from("no shader cores to choose from"),
            });
        }
        let mut rng = match self.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None    => StdRng::from_entropy(),
        };
        let current = pick(&mut rng, usable);
        log::debug!("{}: starting with cores {:#x}", self.name, current);

        Ok(PolicyData::Random(RandomData {
            rng,
            current,
            picks: 1,
        }))
    }

    fn term(&self, _dev: &Device, data: PolicyData) {
        log::debug!("{}: retired after {} picks", self.name, data_of(&data).picks);
    }

    fn get_core_mask(&self, data: &PolicyData, masks: &CoreMasks) -> CoreMask {
        data_of(data).current & masks.permissive()
    }

    fn update_core_status(
        &self,
        data:           &mut PolicyData,
        masks:          &CoreMasks,
        ready:          CoreMask,
        transitioning:  CoreMask,
    ) {
        let d = data_of_mut(data);
        // Anything short of "settled on what we offered" is just noted.
        // The hardware only ever gets the debug-masked share of `current`.
        let usable = masks.permissive();
        if transitioning == 0 && ready == d.current & usable {
            d.current = pick(&mut d.rng, usable);
            d.picks += 1;
            log::trace!("{}: moving on to cores {:#x}", self.name, d.current);
        }
    }
}
