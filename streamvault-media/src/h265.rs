use bytes::Bytes;

/// H.265 NAL unit types (ITU-T H.265, table 7-1). Only the ones the recorder
/// needs to distinguish are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NaluType {
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    Vps = 32,
    Sps = 33,
    Pps = 34,
    Aud = 35,
    Other = 0,
}

impl NaluType {
    #[must_use]
    pub const fn from_header_byte(b: u8) -> Self {
        match (b >> 1) & 0x3F {
            19 => Self::IdrWRadl,
            20 => Self::IdrNLp,
            21 => Self::CraNut,
            32 => Self::Vps,
            33 => Self::Sps,
            34 => Self::Pps,
            35 => Self::Aud,
            _ => Self::Other,
        }
    }
}

/// Whether any NAL unit in the access unit is a random-access point
/// (IDR_W_RADL, IDR_N_LP or CRA).
#[must_use]
pub fn is_random_access(nalus: &[Bytes]) -> bool {
    nalus.iter().filter(|n| !n.is_empty()).any(|n| {
        matches!(
            NaluType::from_header_byte(n[0]),
            NaluType::IdrWRadl | NaluType::IdrNLp | NaluType::CraNut
        )
    })
}
