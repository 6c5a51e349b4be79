use crate::helpe::*;

/// Always offers the same cores: the present ones within `mask`.
#[derive(Debug)]
pub struct FixedPolicy {
    name: &'static str,
    mask: CoreMask,
}

/// The registry's fixed policy, offering every present core.
pub static FIXED: FixedPolicy = FixedPolicy::new("fixed", CoreMask::MAX);

impl FixedPolicy {
    pub const fn new(name: &'static str, mask: CoreMask) -> Self {
        Self { name, mask }
    }

    pub fn mask(&self) -> CoreMask {
        self.mask
    }
}

impl CaPolicy for FixedPolicy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn id(&self) -> PolicyId {
        PolicyId::Fixed
    }

    fn init(&self, _dev: &Device) -> Result<PolicyData, PmError> {
        Ok(PolicyData::Fixed)
    }

    fn term(&self, _dev: &Device, _data: PolicyData) {}

    #[inline(always)]
    fn get_core_mask(&self, _data: &PolicyData, masks: &CoreMasks) -> CoreMask {
        masks.present & self.mask
    }

    fn update_core_status(&self, _: &mut PolicyData, _: &CoreMasks, _: CoreMask, _: CoreMask) {}
}
