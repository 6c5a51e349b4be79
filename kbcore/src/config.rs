use crate::helpe::*;

/// Static description of the device, fixed at probe time.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Shader cores physically present.
    pub shader_present:     CoreMask,
    /// Further restricts which cores may ever be powered. `None` means
    /// all present cores.
    pub debug_core_mask:    Option<CoreMask>,
    /// Name of the core-availability policy to start with. `None` picks
    /// the first registry entry.
    pub ca_policy:          Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            shader_present:     0xF,
            debug_core_mask:    None,
            ca_policy:          None,
        }
    }
}

impl DeviceConfig {
    pub fn with_present(shader_present: CoreMask) -> Self {
        Self {
            shader_present,
            ..Default::default()
        }
    }

    #[inline(always)]
    pub fn debug_mask(&self) -> CoreMask {
        self.debug_core_mask.unwrap_or(self.shader_present)
    }

    /// Gatekeeper to [`Device::new`].
    pub fn validate(&self) -> Result<(), PmError> {
        if self.shader_present == 0 {
            return Err(PmError::Config(String::from("No shader cores present!")));
        }
        let mask = self.debug_mask();
        if mask & self.shader_present == 0 {
            return Err(PmError::InvalidCoreMask {
                mask,
                present: self.shader_present,
            });
        }
        if let Some(ref name) = self.ca_policy {
            crate::pm::policy::find_policy(name)?;
        }

        Ok(())
    }
}

/// Parses a core mask given in hex (`0x` prefix) or decimal. Meant as a
/// `clap` value parser.
pub fn parse_mask(s: &str) -> Result<CoreMask, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => CoreMask::from_str_radix(hex, 16),
        None => s.parse::<CoreMask>(),
    };

    parsed.map_err(|e| format!("bad core mask `{}`: {}", s, e))
}
