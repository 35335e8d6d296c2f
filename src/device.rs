//! XMEGA part catalog, matched against the device signature
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::constants::SIGNATURE_LEN;

/// Part family, one per YAML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub variants: Vec<PartDescriptor>,
}

/// A known chip variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartDescriptor {
    pub name: String,
    #[serde(with = "signature_hex")]
    pub signature: [u8; SIGNATURE_LEN],
    /// Memory type name to physical PDI address range
    #[serde(rename = "regions")]
    pub memory_regions: BTreeMap<String, MemoryRegion>,
}

/// A named, bounded area of non-volatile memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub offset: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub size: u32,
    #[serde(default, deserialize_with = "parse_optional_size")]
    pub page_size: Option<u32>,
}

impl MemoryRegion {
    pub const fn end(&self) -> u32 {
        self.offset + self.size
    }
}

impl ::std::fmt::Display for PartDescriptor {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "{}(0x{})", self.name, hex::encode(self.signature))
    }
}

impl PartDescriptor {
    /// Typed region lookup, `None` when the part has no such memory type
    pub fn region(&self, memtype: &str) -> Option<&MemoryRegion> {
        self.memory_regions.get(memtype)
    }

    pub fn matches(&self, signature: &[u8]) -> bool {
        self.signature[..] == *signature
    }

    pub fn flash_size(&self) -> u32 {
        self.region("flash").map(|r| r.size).unwrap_or_default()
    }

    pub fn eeprom_size(&self) -> u32 {
        self.region("eeprom").map(|r| r.size).unwrap_or_default()
    }
}

/// Catalog of supported parts, in priority order
#[derive(Debug, Clone)]
pub struct PartDb {
    families: Vec<Family>,
}

impl PartDb {
    pub fn load() -> Result<Self> {
        Ok(PartDb {
            families: vec![
                serde_yaml::from_str(include_str!("../devices/xmega-a4u.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/xmega-a3u.yaml"))?,
            ],
        })
    }

    /// Built-in catalog followed by the families of a user supplied file
    pub fn load_with_extra<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut db = Self::load()?;
        let raw = std::fs::read_to_string(path)?;
        let family: Family = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::format_err!("Invalid part file {}: {}", path.display(), e))?;
        log::debug!(
            "Loaded family {} with {} parts from {}",
            family.name,
            family.variants.len(),
            path.display()
        );
        db.families.push(family);
        Ok(db)
    }

    pub fn from_families(families: Vec<Family>) -> Self {
        PartDb { families }
    }

    pub fn families(&self) -> &[Family] {
        &self.families
    }

    /// Every part in catalog order
    pub fn parts(&self) -> impl Iterator<Item = &PartDescriptor> {
        self.families.iter().flat_map(|f| f.variants.iter())
    }

    /// First part in catalog order carrying this signature
    pub fn find_by_signature(&self, signature: &[u8]) -> Option<&PartDescriptor> {
        self.parts().find(|p| p.matches(signature))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&PartDescriptor> {
        self.parts().find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

mod signature_hex {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    use crate::constants::SIGNATURE_LEN;

    pub fn serialize<S: Serializer>(sig: &[u8; SIGNATURE_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode_upper(sig))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; SIGNATURE_LEN], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        let raw = hex::decode(s.trim_start_matches("0x").replace(' ', "")).map_err(D::Error::custom)?;
        raw.as_slice()
            .try_into()
            .map_err(|_| D::Error::custom(format!("signature {:?} is not {} bytes", s, SIGNATURE_LEN)))
    }
}

fn parse_number(s: &str) -> std::result::Result<u32, String> {
    let s = s.trim();
    let (digits, scale, radix) = if s.starts_with("0x") || s.starts_with("0X") {
        (&s[2..], 1, 16)
    } else if let Some(n) = s.strip_suffix("KiB") {
        (n, 1024, 10)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1024, 10)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024, 10)
    } else {
        (s, 1, 10)
    };
    u32::from_str_radix(digits.trim(), radix)
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .ok_or_else(|| format!("error while parsing {:?}", s))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u32),
    String(String),
}

fn parse_address_and_offset<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => parse_number(&s).map_err(serde::de::Error::custom),
    }
}

fn parse_optional_size<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    parse_address_and_offset(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_loads() {
        let db = PartDb::load().unwrap();
        assert!(db.parts().count() >= 8);

        let part = db.find_by_signature(&[0x1e, 0x97, 0x46]).unwrap();
        assert_eq!(part.name, "ATxmega128A4U");
        let flash = part.region("flash").unwrap();
        assert_eq!(flash.offset, 0x0080_0000);
        assert_eq!(flash.size, 0x22000);
        assert_eq!(flash.page_size, Some(0x100));
        assert_eq!(part.region("app").unwrap().size, 128 * 1024);
        assert!(part.region("bogus").is_none());
    }

    #[test]
    fn every_builtin_part_has_flash_and_app() {
        let db = PartDb::load().unwrap();
        for part in db.parts() {
            let flash = part.region("flash").unwrap();
            let app = part.region("app").unwrap();
            let boot = part.region("boot").unwrap();
            assert_eq!(app.offset, flash.offset, "{}", part);
            assert_eq!(app.end(), boot.offset, "{}", part);
            assert_eq!(boot.end(), flash.end(), "{}", part);
        }
    }

    #[test]
    fn first_listed_signature_wins() {
        let yaml = r#"
name: Test
variants:
  - name: X1
    signature: "1E9746"
    regions:
      flash: { offset: "0x08000000", size: "64K" }
  - name: X2
    signature: "1E9746"
    regions:
      flash: { offset: 0, size: 1024 }
"#;
        let family: Family = serde_yaml::from_str(yaml).unwrap();
        let db = PartDb::from_families(vec![family]);
        assert_eq!(db.find_by_signature(&[0x1e, 0x97, 0x46]).unwrap().name, "X1");
        assert_eq!(db.find_by_name("x2").unwrap().region("flash").unwrap().size, 1024);
        assert!(db.find_by_signature(&[0x1e, 0x97, 0x47]).is_none());
    }

    #[test]
    fn malformed_entries_are_rejected() {
        let short_sig = r#"
name: Test
variants:
  - name: X1
    signature: "1E97"
    regions: {}
"#;
        assert!(serde_yaml::from_str::<Family>(short_sig).is_err());

        let bad_size = r#"
name: Test
variants:
  - name: X1
    signature: "1E9746"
    regions:
      flash: { offset: 0, size: "12Q" }
"#;
        assert!(serde_yaml::from_str::<Family>(bad_size).is_err());
    }

    #[test]
    fn number_suffixes() {
        assert_eq!(parse_number("0x8c0000"), Ok(0x8c0000));
        assert_eq!(parse_number("8K"), Ok(8192));
        assert_eq!(parse_number("2KiB"), Ok(2048));
        assert_eq!(parse_number("4KB"), Ok(4096));
        assert_eq!(parse_number("256"), Ok(256));
        assert!(parse_number("xyz").is_err());
    }
}
