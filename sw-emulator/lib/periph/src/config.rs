/*++

Licensed under the Apache-2.0 license.

File Name:

    config.rs

Abstract:

    File contains the configurable-property surface of the control plane and
    its validation.

--*/

use thiserror::Error;

use crate::lifecycle::{LcTemplates, LC_CNT_WORDS, LC_STATE_WORDS, OWNERSHIP_WORDS, SOC_DBG_WORDS};

/// Largest legal silicon-creator / product id.
const MAX_HW_ID: u32 = 0x8000;

/// Maximum number of ROMs whose check results the power manager aggregates.
pub const MAX_NUM_ROM: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("property {0} is not a valid hex string")]
    BadHex(&'static str),

    #[error("property {0} must be {1} hex digits, got {2}")]
    WrongLength(&'static str, usize, usize),

    #[error("property {0} has invalid value {1:#x}")]
    InvalidId(&'static str, u32),

    #[error("property {0} collides with its partner template")]
    TemplateCollision(&'static str),

    #[error("property num_rom must be 1..={MAX_NUM_ROM}, got {0}")]
    InvalidNumRom(usize),
}

/// Raw property strings, as they arrive from the platform configuration
/// layer. Hex strings carry their bytes/words in string order.
#[derive(Clone, Debug)]
pub struct SocProperties {
    pub raw_unlock_token: String,
    pub lc_state_first: String,
    pub lc_state_last: String,
    pub lc_trscnt_first: String,
    pub lc_trscnt_last: String,
    pub ownership_first: String,
    pub ownership_last: String,
    pub socdbg_first: String,
    pub socdbg_last: String,
    pub silicon_creator_id: u32,
    pub product_id: u32,
    pub revision_id: u32,
    pub volatile_raw_unlock: bool,
    pub socdbg: bool,
    pub num_rom: usize,
    pub fetch_ctrl: bool,
    pub main: bool,
    pub por: bool,
}

impl Default for SocProperties {
    fn default() -> Self {
        Self {
            raw_unlock_token: "eaad1fef9396fcada248174211592af1".into(),
            lc_state_first:
                "22ad0788ae76feab44af38a1b93f70e494bd72e0cd447e4734a681d3e769b4ea39d68066f2ca229e"
                    .into(),
            lc_state_last:
                "f8d6a929623183c12314ed4c8814cdf64f6e3204df94e32649198fd950cf1f2b170fbefe6bc16341"
                    .into(),
            lc_trscnt_first:
                "575b78da446ef434bb38a4cce73cedb3a99f64a25958af96f5ad3b44c0a198e9b098b2089a79ccecd2ae09518b7b4149"
                    .into(),
            lc_trscnt_last:
                "85031e4d400fcefcbbcdfae40101a02f54ba9effce895b30fdeff50b10420e8770e9ce71940bc0ef58f30e88572e543f"
                    .into(),
            ownership_first: "4920cf658444bbd149ff3dbe561a6006".into(),
            ownership_last: "2f85403d018b84304737760af375c3f6".into(),
            socdbg_first: "c8d510dc".into(),
            socdbg_last: "544577cc".into(),
            silicon_creator_id: 0x1001,
            product_id: 0x2002,
            revision_id: 1,
            volatile_raw_unlock: true,
            socdbg: true,
            num_rom: 3,
            fetch_ctrl: true,
            main: true,
            por: true,
        }
    }
}

/// Validated configuration consumed by the root bus.
#[derive(Clone)]
pub struct SocConfig {
    pub raw_unlock_token: [u8; 16],
    pub templates: LcTemplates,
    pub silicon_creator_id: u32,
    pub product_id: u32,
    pub revision_id: u32,
    pub volatile_raw_unlock: bool,
    pub socdbg: bool,
    pub num_rom: usize,
    pub fetch_ctrl: bool,
    pub main: bool,
    pub por: bool,
}

fn decode_hex_bytes<const N: usize>(
    name: &'static str,
    hex: &str,
) -> Result<[u8; N], ConfigError> {
    if !hex.is_ascii() {
        return Err(ConfigError::BadHex(name));
    }
    if hex.len() != N * 2 {
        return Err(ConfigError::WrongLength(name, N * 2, hex.len()));
    }
    let mut bytes = [0u8; N];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| ConfigError::BadHex(name))?;
    }
    Ok(bytes)
}

fn decode_hex_words<const N: usize>(
    name: &'static str,
    hex: &str,
) -> Result<[u16; N], ConfigError> {
    if !hex.is_ascii() {
        return Err(ConfigError::BadHex(name));
    }
    if hex.len() != N * 4 {
        return Err(ConfigError::WrongLength(name, N * 4, hex.len()));
    }
    let mut words = [0u16; N];
    for (i, word) in words.iter_mut().enumerate() {
        *word = u16::from_str_radix(&hex[i * 4..i * 4 + 4], 16)
            .map_err(|_| ConfigError::BadHex(name))?;
    }
    Ok(words)
}

/// Template words must be nonzero (zero marks the blank sequence) and the
/// "first"/"last" values must differ in every slot for decode to be
/// unambiguous.
fn check_templates<const N: usize>(
    name: &'static str,
    first: &[u16; N],
    last: &[u16; N],
) -> Result<(), ConfigError> {
    for i in 0..N {
        if first[i] == 0 || last[i] == 0 || first[i] == last[i] {
            return Err(ConfigError::TemplateCollision(name));
        }
    }
    Ok(())
}

fn check_hw_id(name: &'static str, val: u32) -> Result<(), ConfigError> {
    if val == 0 || val > MAX_HW_ID {
        return Err(ConfigError::InvalidId(name, val));
    }
    Ok(())
}

impl SocConfig {
    /// Decode and validate the property strings. Any failure here is fatal
    /// at device startup.
    pub fn new(props: &SocProperties) -> Result<Self, ConfigError> {
        let raw_unlock_token = decode_hex_bytes("raw_unlock_token", &props.raw_unlock_token)?;

        let state_first: [u16; LC_STATE_WORDS] =
            decode_hex_words("lc_state_first", &props.lc_state_first)?;
        let state_last: [u16; LC_STATE_WORDS] =
            decode_hex_words("lc_state_last", &props.lc_state_last)?;
        check_templates("lc_state_first", &state_first, &state_last)?;

        let cnt_first: [u16; LC_CNT_WORDS] =
            decode_hex_words("lc_trscnt_first", &props.lc_trscnt_first)?;
        let cnt_last: [u16; LC_CNT_WORDS] =
            decode_hex_words("lc_trscnt_last", &props.lc_trscnt_last)?;
        check_templates("lc_trscnt_first", &cnt_first, &cnt_last)?;

        let ownership_first: [u16; OWNERSHIP_WORDS] =
            decode_hex_words("ownership_first", &props.ownership_first)?;
        let ownership_last: [u16; OWNERSHIP_WORDS] =
            decode_hex_words("ownership_last", &props.ownership_last)?;
        check_templates("ownership_first", &ownership_first, &ownership_last)?;

        let socdbg_first: [u16; SOC_DBG_WORDS] =
            decode_hex_words("socdbg_first", &props.socdbg_first)?;
        let socdbg_last: [u16; SOC_DBG_WORDS] =
            decode_hex_words("socdbg_last", &props.socdbg_last)?;
        check_templates("socdbg_first", &socdbg_first, &socdbg_last)?;

        check_hw_id("silicon_creator_id", props.silicon_creator_id)?;
        check_hw_id("product_id", props.product_id)?;
        if props.revision_id == 0 {
            return Err(ConfigError::InvalidId("revision_id", 0));
        }
        if props.num_rom == 0 || props.num_rom > MAX_NUM_ROM {
            return Err(ConfigError::InvalidNumRom(props.num_rom));
        }

        Ok(Self {
            raw_unlock_token,
            templates: LcTemplates {
                state_first,
                state_last,
                cnt_first,
                cnt_last,
                ownership_first,
                ownership_last,
                socdbg_first,
                socdbg_last,
            },
            silicon_creator_id: props.silicon_creator_id,
            product_id: props.product_id,
            revision_id: props.revision_id,
            volatile_raw_unlock: props.volatile_raw_unlock,
            socdbg: props.socdbg,
            num_rom: props.num_rom,
            fetch_ctrl: props.fetch_ctrl,
            main: props.main,
            por: props.por,
        })
    }

    /// HW_REVISION0 register value.
    pub fn hw_revision0(&self) -> u32 {
        (self.silicon_creator_id << 16) | self.product_id
    }

    /// HW_REVISION1 register value.
    pub fn hw_revision1(&self) -> u32 {
        self.revision_id
    }
}

impl Default for SocConfig {
    fn default() -> Self {
        // The default properties are always valid.
        Self::new(&SocProperties::default()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_properties_are_valid() {
        let config = SocConfig::default();
        assert_eq!(config.raw_unlock_token[0], 0xea);
        assert_eq!(config.raw_unlock_token[15], 0xf1);
        assert_eq!(config.hw_revision0(), 0x1001_2002);
        assert_eq!(config.hw_revision1(), 1);
    }

    #[test]
    fn test_wrong_length_token() {
        let props = SocProperties {
            raw_unlock_token: "eaad1fef".into(),
            ..Default::default()
        };
        assert_eq!(
            SocConfig::new(&props).err(),
            Some(ConfigError::WrongLength("raw_unlock_token", 32, 8))
        );
    }

    #[test]
    fn test_bad_hex_rejected() {
        let props = SocProperties {
            raw_unlock_token: "zzad1fef9396fcada248174211592af1".into(),
            ..Default::default()
        };
        assert_eq!(
            SocConfig::new(&props).err(),
            Some(ConfigError::BadHex("raw_unlock_token"))
        );
    }

    #[test]
    fn test_template_collision_rejected() {
        let props = SocProperties {
            socdbg_first: "c8d510dc".into(),
            socdbg_last: "c8d577cc".into(),
            ..Default::default()
        };
        assert_eq!(
            SocConfig::new(&props).err(),
            Some(ConfigError::TemplateCollision("socdbg_first"))
        );
    }

    #[test]
    fn test_zero_template_word_rejected() {
        let props = SocProperties {
            socdbg_first: "0000c8d5".into(),
            ..Default::default()
        };
        assert_eq!(
            SocConfig::new(&props).err(),
            Some(ConfigError::TemplateCollision("socdbg_first"))
        );
    }

    #[test]
    fn test_id_bounds() {
        let props = SocProperties {
            silicon_creator_id: 0,
            ..Default::default()
        };
        assert_eq!(
            SocConfig::new(&props).err(),
            Some(ConfigError::InvalidId("silicon_creator_id", 0))
        );

        let props = SocProperties {
            product_id: 0x8001,
            ..Default::default()
        };
        assert_eq!(
            SocConfig::new(&props).err(),
            Some(ConfigError::InvalidId("product_id", 0x8001))
        );

        let props = SocProperties {
            revision_id: 0,
            ..Default::default()
        };
        assert_eq!(
            SocConfig::new(&props).err(),
            Some(ConfigError::InvalidId("revision_id", 0))
        );

        let props = SocProperties {
            num_rom: 9,
            ..Default::default()
        };
        assert_eq!(
            SocConfig::new(&props).err(),
            Some(ConfigError::InvalidNumRom(9))
        );
    }

    #[test]
    fn test_templates_decode_round_trip() {
        use crate::lifecycle::LcState;
        let config = SocConfig::default();
        let words = config.templates.state_words(LcState::Prod).unwrap();
        assert_eq!(config.templates.decode_state(&words), Some(LcState::Prod));
    }
}
