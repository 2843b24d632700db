//! Static metadata for the geographic markets the reports cover.

use std::fmt;

/// A market the pipeline reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Market {
    Sg,
    Vn,
    Kh,
    Th,
    Hk,
}

pub const ALL_MARKETS: &[Market] = &[Market::Sg, Market::Vn, Market::Kh, Market::Th, Market::Hk];

impl Market {
    pub fn from_code(code: &str) -> Option<Market> {
        match code.to_ascii_uppercase().as_str() {
            "SG" => Some(Market::Sg),
            "VN" => Some(Market::Vn),
            "KH" => Some(Market::Kh),
            "TH" => Some(Market::Th),
            "HK" => Some(Market::Hk),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Market::Sg => "SG",
            Market::Vn => "VN",
            Market::Kh => "KH",
            Market::Th => "TH",
            Market::Hk => "HK",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Market::Sg => "Singapore",
            Market::Vn => "Vietnam",
            Market::Kh => "Cambodia",
            Market::Th => "Thailand",
            Market::Hk => "Hong Kong",
        }
    }

    /// Region id used as a query parameter by the service.
    pub fn region_id(&self) -> i64 {
        match self {
            Market::Sg => 1,
            Market::Vn => 2,
            Market::Kh => 3,
            Market::Hk => 7,
            Market::Th => 8,
        }
    }

    /// Offset from UTC, in hours, for local-time date bookkeeping.
    pub fn utc_offset_hours(&self) -> i64 {
        match self {
            Market::Sg | Market::Hk => 8,
            Market::Vn | Market::Kh | Market::Th => 7,
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_is_case_insensitive() {
        assert_eq!(Market::from_code("sg"), Some(Market::Sg));
        assert_eq!(Market::from_code("HK"), Some(Market::Hk));
        assert_eq!(Market::from_code("xx"), None);
    }

    #[test]
    fn test_metadata() {
        assert_eq!(Market::Th.region_id(), 8);
        assert_eq!(Market::Th.utc_offset_hours(), 7);
        assert_eq!(Market::Sg.name(), "Singapore");
        assert_eq!(ALL_MARKETS.len(), 5);
    }
}
