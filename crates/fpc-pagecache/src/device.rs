use std::fmt;
use std::str::FromStr;

/// Requester class. Every device type has its own cache subdirectory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeviceType {
    #[default]
    Desktop,
    Tablet,
    Mobile,
}

const TABLET_MARKERS: &[&str] = &["ipad", "tablet", "kindle", "silk/", "playbook", "nexus 7", "nexus 10"];
const MOBILE_MARKERS: &[&str] = &[
    "mobi",
    "iphone",
    "ipod",
    "blackberry",
    "bb10",
    "opera mini",
    "windows phone",
    "iemobile",
    "webos",
];

impl DeviceType {
    /// Every known type, in the order purges visit them.
    pub const ALL: [Self; 3] = [Self::Desktop, Self::Tablet, Self::Mobile];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Tablet => "tablet",
            Self::Mobile => "mobile",
        }
    }

    /// Classify a `User-Agent` header.
    ///
    /// Android without `mobile` is a tablet. Anything unrecognized is a
    /// desktop.
    #[must_use]
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        if TABLET_MARKERS.iter().any(|m| ua.contains(m))
            || (ua.contains("android") && !ua.contains("mobile"))
        {
            return Self::Tablet;
        }
        if ua.contains("android") || MOBILE_MARKERS.iter().any(|m| ua.contains(m)) {
            return Self::Mobile;
        }
        Self::Desktop
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown device type: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_user_agent() {
        let cases = [
            (
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_3) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36",
                DeviceType::Desktop,
            ),
            (
                "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) AppleWebKit/605.1.15 Mobile/15E148",
                DeviceType::Mobile,
            ),
            (
                "Mozilla/5.0 (Linux; Android 13; Pixel 7) AppleWebKit/537.36 Chrome/112.0 Mobile Safari/537.36",
                DeviceType::Mobile,
            ),
            (
                "Mozilla/5.0 (Linux; Android 13; SM-X700) AppleWebKit/537.36 Chrome/112.0 Safari/537.36",
                DeviceType::Tablet,
            ),
            (
                "Mozilla/5.0 (iPad; CPU OS 16_0 like Mac OS X) AppleWebKit/605.1.15 Mobile/15E148",
                DeviceType::Tablet,
            ),
            ("", DeviceType::Desktop),
        ];

        for (ua, expected) in cases {
            assert_eq!(DeviceType::from_user_agent(ua), expected, "{ua}");
        }
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("Mobile".parse::<DeviceType>().unwrap(), DeviceType::Mobile);
        assert_eq!(DeviceType::Tablet.to_string(), "tablet");
        assert!("watch".parse::<DeviceType>().is_err());
    }
}
