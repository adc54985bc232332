use crate::error::HciError;
use crate::gap::constants::*;
use std::fmt;
use std::str::FromStr;

/// Link layer role of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Central,
    Peripheral,
}

impl From<u8> for Role {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Role::Peripheral,
            _ => Role::Central,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Public,
    Random,
    PublicIdentity,
    RandomIdentity,
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            PUBLIC_DEVICE_ADDRESS => AddressType::Public,
            RANDOM_DEVICE_ADDRESS => AddressType::Random,
            PUBLIC_IDENTITY_ADDRESS => AddressType::PublicIdentity,
            RANDOM_IDENTITY_ADDRESS => AddressType::RandomIdentity,
            _ => AddressType::Public,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
            AddressType::PublicIdentity => PUBLIC_IDENTITY_ADDRESS,
            AddressType::RandomIdentity => RANDOM_IDENTITY_ADDRESS,
        }
    }
}

/// Device address, stored least significant byte first as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub const ANY: BdAddr = BdAddr { bytes: [0; 6] };

    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_any(&self) -> bool {
        self.bytes == [0; 6]
    }

    /// Random static address: two most significant bits set
    pub fn is_static_random(&self) -> bool {
        self.bytes[5] & 0xC0 == 0xC0
    }

    /// Resolvable private address: most significant bits `01`
    pub fn is_resolvable_private(&self) -> bool {
        self.bytes[5] & 0xC0 == 0x40
    }

    /// Generate a new random static address
    pub fn new_static_random() -> Self {
        loop {
            let mut bytes: [u8; 6] = rand::random();
            bytes[5] |= 0xC0;
            // All ones and all zeros in the random part are not allowed
            let random_part = [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5] & 0x3F];
            if random_part != [0; 6] && random_part != [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x3F] {
                return Self { bytes };
            }
        }
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

impl FromStr for BdAddr {
    type Err = HciError;

    /// Parse the conventional `AA:BB:CC:DD:EE:FF` notation
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(HciError::InvalidInput(format!("bad address: {}", s)));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(HciError::InvalidInput(format!("bad address: {}", s)));
            }
            bytes[5 - i] = u8::from_str_radix(part, 16)
                .map_err(|_| HciError::InvalidInput(format!("bad address: {}", s)))?;
        }
        Ok(Self { bytes })
    }
}

/// LE address with its type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeAddr {
    pub kind: AddressType,
    pub addr: BdAddr,
}

impl LeAddr {
    pub const ANY: LeAddr = LeAddr {
        kind: AddressType::Public,
        addr: BdAddr::ANY,
    };

    pub fn new(kind: AddressType, addr: BdAddr) -> Self {
        Self { kind, addr }
    }

    pub fn public(addr: BdAddr) -> Self {
        Self::new(AddressType::Public, addr)
    }

    pub fn random(addr: BdAddr) -> Self {
        Self::new(AddressType::Random, addr)
    }

    pub fn is_any(&self) -> bool {
        self.addr.is_any()
    }

    /// Type byte as carried in HCI parameters
    pub fn type_byte(&self) -> u8 {
        u8::from(self.kind)
    }

    /// 7-byte storage form: type followed by the address
    pub fn to_bytes(&self) -> [u8; 7] {
        let mut out = [0u8; 7];
        out[0] = self.type_byte();
        out[1..].copy_from_slice(&self.addr.bytes);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 7 {
            return None;
        }
        Some(Self::new(
            AddressType::from(bytes[0]),
            BdAddr::from_slice(&bytes[1..7])?,
        ))
    }
}

impl fmt::Display for LeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            AddressType::Public => "public",
            AddressType::Random => "random",
            AddressType::PublicIdentity => "public-id",
            AddressType::RandomIdentity => "random-id",
        };
        write!(f, "{} ({})", self.addr, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse_and_display() {
        let addr: BdAddr = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(addr.bytes, [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");

        assert!("AA:BB:CC".parse::<BdAddr>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<BdAddr>().is_err());
    }

    #[test]
    fn test_static_random_generation() {
        for _ in 0..16 {
            let addr = BdAddr::new_static_random();
            assert!(addr.is_static_random());
            assert!(!addr.is_resolvable_private());
        }
    }

    #[test]
    fn test_le_addr_storage_form() {
        let addr = LeAddr::random(BdAddr::new([1, 2, 3, 4, 5, 0xC6]));
        let bytes = addr.to_bytes();
        assert_eq!(bytes[0], RANDOM_DEVICE_ADDRESS);
        assert_eq!(LeAddr::from_bytes(&bytes), Some(addr));
        assert_eq!(LeAddr::from_bytes(&bytes[..6]), None);
    }
}
