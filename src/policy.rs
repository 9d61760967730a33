//! Pure admission policy checks over a settings snapshot.
//!
//! `evaluate` has no side effects and depends only on its arguments; every
//! check reads the same snapshot, so a concurrent settings reload cannot
//! produce a mixed decision.

use crate::config::{kinds_match, Settings};
use crate::event::{leading_zero_bits, Event};
use crate::protocol::Rejection;

/// Evaluate the policy checks in order; the first violation wins.
pub fn evaluate(event: &Event, settings: &Settings, now: u64) -> Result<(), Rejection> {
    let limits = &settings.limits.event;

    // Content length, per record; records scoped by `kinds` only apply to
    // matching events.
    for record in limits.content.records() {
        if record.max_length == 0 || !kinds_match(&record.kinds, event.kind) {
            continue;
        }
        if event.content.len() as u64 > record.max_length {
            return Err(Rejection::ContentTooLong(record.max_length));
        }
    }

    let skew = &limits.created_at;
    if skew.max_positive_delta > 0
        && event.created_at > now.saturating_add(skew.max_positive_delta)
    {
        return Err(Rejection::CreatedAtTooFar(skew.max_positive_delta));
    }
    if skew.max_negative_delta > 0
        && event.created_at.saturating_add(skew.max_negative_delta) < now
    {
        return Err(Rejection::CreatedAtTooOld(skew.max_negative_delta));
    }

    let want = limits.event_id.min_leading_zero_bits;
    if want > 0 {
        let got = leading_zero_bits(&event.id);
        if got < want {
            return Err(Rejection::IdPow { got, want });
        }
    }
    let want = limits.pubkey.min_leading_zero_bits;
    if want > 0 {
        let got = leading_zero_bits(&event.pubkey);
        if got < want {
            return Err(Rejection::PubkeyPow { got, want });
        }
    }

    if let Some(prefixes) = &limits.pubkey.whitelist {
        if !prefixes.is_empty() && !prefixes.iter().any(|p| event.pubkey.starts_with(p.as_str())) {
            return Err(Rejection::PubkeyNotAllowed);
        }
    }
    if let Some(prefixes) = &limits.pubkey.blacklist {
        if prefixes.iter().any(|p| event.pubkey.starts_with(p.as_str())) {
            return Err(Rejection::PubkeyNotAllowed);
        }
    }

    if let Some(filters) = &limits.kind.whitelist {
        if !filters.is_empty() && !filters.iter().any(|f| f.matches(event.kind)) {
            return Err(Rejection::KindNotAllowed(event.kind));
        }
    }
    if let Some(filters) = &limits.kind.blacklist {
        if filters.iter().any(|f| f.matches(event.kind)) {
            return Err(Rejection::KindNotAllowed(event.kind));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContentLimit, ContentLimits, KindFilter};
    use crate::event::Tag;

    const NOW: u64 = 1_700_000_000;

    fn plain_event(kind: u16, content: &str) -> Event {
        Event {
            id: "00ab".repeat(16),
            pubkey: "7fab".repeat(16),
            kind,
            created_at: NOW,
            tags: vec![],
            content: content.into(),
            sig: String::new(),
        }
    }

    #[test]
    fn default_settings_accept_everything() {
        let settings = Settings::default();
        assert_eq!(evaluate(&plain_event(1, "hello"), &settings, NOW), Ok(()));
    }

    #[test]
    fn content_limit_applies_to_matching_kind_only() {
        let mut settings = Settings::default();
        settings.limits.event.content = ContentLimits::Many(vec![ContentLimit {
            max_length: 200,
            kinds: Some(vec![KindFilter::Single(1)]),
        }]);
        let long = "x".repeat(300);
        assert_eq!(
            evaluate(&plain_event(1, &long), &settings, NOW),
            Err(Rejection::ContentTooLong(200))
        );
        assert_eq!(evaluate(&plain_event(2, &long), &settings, NOW), Ok(()));
    }

    #[test]
    fn first_content_violation_wins() {
        let mut settings = Settings::default();
        settings.limits.event.content = ContentLimits::Many(vec![
            ContentLimit {
                max_length: 100,
                kinds: Some(vec![KindFilter::Single(1)]),
            },
            ContentLimit {
                max_length: 50,
                kinds: None,
            },
        ]);
        let long = "x".repeat(150);
        assert_eq!(
            evaluate(&plain_event(1, &long), &settings, NOW),
            Err(Rejection::ContentTooLong(100))
        );
        // Kind 2 skips the scoped record and trips the universal one.
        assert_eq!(
            evaluate(&plain_event(2, &long), &settings, NOW),
            Err(Rejection::ContentTooLong(50))
        );
    }

    #[test]
    fn zero_max_length_disables_record() {
        let mut settings = Settings::default();
        settings.limits.event.content = ContentLimits::Single(ContentLimit {
            max_length: 0,
            kinds: None,
        });
        let long = "x".repeat(100_000);
        assert_eq!(evaluate(&plain_event(1, &long), &settings, NOW), Ok(()));
    }

    #[test]
    fn future_skew_rejected() {
        let mut settings = Settings::default();
        settings.limits.event.created_at.max_positive_delta = 600;
        let mut ev = plain_event(1, "");
        ev.created_at = NOW + 900;
        assert_eq!(
            evaluate(&ev, &settings, NOW),
            Err(Rejection::CreatedAtTooFar(600))
        );
        ev.created_at = NOW + 600;
        assert_eq!(evaluate(&ev, &settings, NOW), Ok(()));
    }

    #[test]
    fn past_skew_rejected() {
        let mut settings = Settings::default();
        settings.limits.event.created_at.max_negative_delta = 3600;
        let mut ev = plain_event(1, "");
        ev.created_at = NOW - 7200;
        assert_eq!(
            evaluate(&ev, &settings, NOW),
            Err(Rejection::CreatedAtTooOld(3600))
        );
        ev.created_at = NOW - 3600;
        assert_eq!(evaluate(&ev, &settings, NOW), Ok(()));
    }

    #[test]
    fn zero_deltas_disable_skew_checks() {
        let settings = Settings::default();
        let mut ev = plain_event(1, "");
        ev.created_at = NOW + 1_000_000;
        assert_eq!(evaluate(&ev, &settings, NOW), Ok(()));
        ev.created_at = 1;
        assert_eq!(evaluate(&ev, &settings, NOW), Ok(()));
    }

    #[test]
    fn event_id_pow_enforced() {
        let mut settings = Settings::default();
        settings.limits.event.event_id.min_leading_zero_bits = 16;
        let mut ev = plain_event(1, "");
        ev.id = format!("000f{}", "ab".repeat(30));
        assert_eq!(
            evaluate(&ev, &settings, NOW),
            Err(Rejection::IdPow { got: 12, want: 16 })
        );
        ev.id = format!("0000{}", "ab".repeat(30));
        assert_eq!(evaluate(&ev, &settings, NOW), Ok(()));
    }

    #[test]
    fn pubkey_pow_enforced() {
        let mut settings = Settings::default();
        settings.limits.event.pubkey.min_leading_zero_bits = 8;
        let mut ev = plain_event(1, "");
        ev.pubkey = "ab".repeat(32);
        assert_eq!(
            evaluate(&ev, &settings, NOW),
            Err(Rejection::PubkeyPow { got: 0, want: 8 })
        );
    }

    #[test]
    fn pubkey_whitelist_prefix_match() {
        let mut settings = Settings::default();
        settings.limits.event.pubkey.whitelist = Some(vec!["7f".into()]);
        assert_eq!(evaluate(&plain_event(1, ""), &settings, NOW), Ok(()));
        settings.limits.event.pubkey.whitelist = Some(vec!["99".into()]);
        assert_eq!(
            evaluate(&plain_event(1, ""), &settings, NOW),
            Err(Rejection::PubkeyNotAllowed)
        );
    }

    #[test]
    fn empty_pubkey_whitelist_is_inert() {
        let mut settings = Settings::default();
        settings.limits.event.pubkey.whitelist = Some(vec![]);
        assert_eq!(evaluate(&plain_event(1, ""), &settings, NOW), Ok(()));
    }

    #[test]
    fn pubkey_blacklist_prefix_match() {
        let mut settings = Settings::default();
        settings.limits.event.pubkey.blacklist = Some(vec!["7fab".into()]);
        assert_eq!(
            evaluate(&plain_event(1, ""), &settings, NOW),
            Err(Rejection::PubkeyNotAllowed)
        );
    }

    #[test]
    fn kind_whitelist_and_ranges() {
        let mut settings = Settings::default();
        settings.limits.event.kind.whitelist =
            Some(vec![KindFilter::Single(1), KindFilter::Range([30000, 39999])]);
        assert_eq!(evaluate(&plain_event(1, ""), &settings, NOW), Ok(()));
        assert_eq!(evaluate(&plain_event(30023, ""), &settings, NOW), Ok(()));
        assert_eq!(
            evaluate(&plain_event(4, ""), &settings, NOW),
            Err(Rejection::KindNotAllowed(4))
        );
    }

    #[test]
    fn kind_blacklist() {
        let mut settings = Settings::default();
        settings.limits.event.kind.blacklist = Some(vec![KindFilter::Range([4, 6])]);
        assert_eq!(
            evaluate(&plain_event(5, ""), &settings, NOW),
            Err(Rejection::KindNotAllowed(5))
        );
        assert_eq!(evaluate(&plain_event(7, ""), &settings, NOW), Ok(()));
    }

    #[test]
    fn evaluation_ignores_tags_and_balance_fields() {
        // Balance and admission are not policy concerns; an event carrying
        // arbitrary tags passes a default policy untouched.
        let mut ev = plain_event(1, "");
        ev.tags = vec![Tag(vec!["expiration".into(), "1".into()])];
        assert_eq!(evaluate(&ev, &Settings::default(), NOW), Ok(()));
    }
}
