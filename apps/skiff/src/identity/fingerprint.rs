//! Anonymous-session fingerprinting.
//!
//! The fingerprint is a deliberately low-entropy identifier: enough for the
//! backend to recognize a returning session, not enough to track a person.
//! The hash is order-dependent over UTF-16 code units so that fingerprints
//! stay stable for sessions migrating from the browser build of this client.

/// Environment attributes folded into the fingerprint, in hash order.
/// Every field is injectable so embedders with richer environments (a real
/// user agent, a real screen) can supply them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentProbe {
    pub user_agent: String,
    pub locale: String,
    pub screen: String,
    pub timezone_offset_minutes: i32,
    pub concurrency: usize,
    pub platform: String,
}

impl EnvironmentProbe {
    /// Best-effort detection for headless embeddings. Terminal geometry
    /// stands in for screen geometry when nothing better exists.
    pub fn detect() -> Self {
        let screen = match (std::env::var("COLUMNS"), std::env::var("LINES")) {
            (Ok(cols), Ok(lines)) => format!("{cols}x{lines}"),
            _ => "80x24".to_string(),
        };
        let timezone_offset_minutes = time::UtcOffset::current_local_offset()
            .map(|offset| offset.whole_seconds() / 60)
            .unwrap_or(0);
        Self {
            user_agent: format!("{}/{}", skiff_proto::APP_NAME, skiff_proto::APP_VERSION),
            locale: std::env::var("LANG")
                .ok()
                .filter(|lang| !lang.trim().is_empty())
                .unwrap_or_else(|| "en-US".to_string()),
            screen,
            timezone_offset_minutes,
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// Rolling hash over the joined probe components: 32-bit signed
/// `h = (h << 5) - h + unit` with wrapping, folded to non-negative and
/// rendered as lowercase hex.
pub fn fingerprint(probe: &EnvironmentProbe) -> String {
    let joined = [
        probe.user_agent.as_str(),
        probe.locale.as_str(),
        probe.screen.as_str(),
        &probe.timezone_offset_minutes.to_string(),
        &probe.concurrency.to_string(),
        probe.platform.as_str(),
    ]
    .join("|");

    let mut hash: i32 = 0;
    for unit in joined.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    format!("{:x}", hash.unsigned_abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> EnvironmentProbe {
        EnvironmentProbe {
            user_agent: "skiff/0.1.0".into(),
            locale: "en-US".into(),
            screen: "1920x1080".into(),
            timezone_offset_minutes: -480,
            concurrency: 8,
            platform: "linux".into(),
        }
    }

    #[test]
    fn identical_probes_hash_identically() {
        assert_eq!(fingerprint(&probe()), fingerprint(&probe()));
    }

    #[test]
    fn each_component_influences_the_hash() {
        let base = fingerprint(&probe());

        let mut changed = probe();
        changed.user_agent = "skiff/0.2.0".into();
        assert_ne!(fingerprint(&changed), base);

        let mut changed = probe();
        changed.locale = "ja-JP".into();
        assert_ne!(fingerprint(&changed), base);

        let mut changed = probe();
        changed.screen = "1280x720".into();
        assert_ne!(fingerprint(&changed), base);

        let mut changed = probe();
        changed.timezone_offset_minutes = 60;
        assert_ne!(fingerprint(&changed), base);

        let mut changed = probe();
        changed.concurrency = 4;
        assert_ne!(fingerprint(&changed), base);

        let mut changed = probe();
        changed.platform = "macos".into();
        assert_ne!(fingerprint(&changed), base);
    }

    #[test]
    fn component_order_matters() {
        let mut swapped = probe();
        std::mem::swap(&mut swapped.user_agent, &mut swapped.locale);
        assert_ne!(fingerprint(&swapped), fingerprint(&probe()));
    }

    #[test]
    fn hash_is_non_negative_hex() {
        let hex = fingerprint(&probe());
        assert!(!hex.is_empty());
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
