/// Closed set of load-balancing strategies. Selection dispatches on the
/// variant tag; there is no trait object on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Random,
    LeastRequests,
    FastestResponse,
    Weighted,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "round_robin" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            "least_requests" => Some(Self::LeastRequests),
            "fastest_response" => Some(Self::FastestResponse),
            "weighted" => Some(Self::Weighted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::LeastRequests => "least_requests",
            Self::FastestResponse => "fastest_response",
            Self::Weighted => "weighted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_strategies() {
        for name in [
            "round_robin",
            "random",
            "least_requests",
            "fastest_response",
            "weighted",
        ] {
            let s = Strategy::parse(name).unwrap();
            assert_eq!(s.as_str(), name);
        }
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!(Strategy::parse("p2c").is_none());
        assert!(Strategy::parse("").is_none());
        assert!(Strategy::parse("RoundRobin").is_none());
    }
}
