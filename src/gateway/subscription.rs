//! Subscription entitlement documents and the pure ledger algorithms over
//! them.
//!
//! A user's `subscription_data` column holds either the legacy bare JSON
//! array of items or the current `{"items": [...], "last_reset_at": N}`
//! object. Numeric fields written by the billing process may be JSON numbers
//! or numeric strings; decoding canonicalises both to `i64` so nothing past
//! [`SubscriptionData::parse`] sees the difference.
//!
//! Timestamps above `1e12` are milliseconds, everything else is seconds.
//! "Now" always enters these functions in seconds and is converted into the
//! unit of whatever value it is compared against.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::error::LedgerError;

pub const STATUS_DEPLOYED: &str = "deployed";
pub const FIVE_HOUR_WINDOW_SECS: i64 = 5 * 60 * 60;
pub const SEVEN_DAY_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;

const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;
const TOKEN_PREFIX: &str = "fp:";
const TOKEN_INDEX_PREFIX: &str = "i:";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionLimit {
    #[serde(default, deserialize_with = "flexible_i64")]
    pub total: i64,
    #[serde(default, deserialize_with = "flexible_i64")]
    pub available: i64,
    #[serde(default, deserialize_with = "flexible_i64")]
    pub reset_at: i64,
}

impl SubscriptionLimit {
    /// Restores a stale window. Returns `(rolled_over, changed)`.
    fn roll_over(&mut self, now_sec: i64, interval_sec: i64) -> (bool, bool) {
        if now_in_same_unit(self.reset_at, now_sec) <= self.reset_at {
            return (false, false);
        }
        let mut changed = false;
        if self.available != self.total {
            self.available = self.total;
            changed = true;
        }
        let next = advance_reset_at(self.reset_at, now_sec, interval_sec);
        if next != self.reset_at {
            self.reset_at = next;
            changed = true;
        }
        (true, changed)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDuration {
    #[serde(default, deserialize_with = "flexible_i64")]
    pub start_at: i64,
    #[serde(default, deserialize_with = "flexible_i64")]
    pub end_at: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub auto_renew_enabled: bool,
}

impl SubscriptionDuration {
    /// Both bounds must be set; each is compared in its own unit.
    pub fn contains(&self, now_sec: i64) -> bool {
        if self.start_at == 0 || self.end_at == 0 {
            return false;
        }
        if now_in_same_unit(self.start_at, now_sec) < self.start_at {
            return false;
        }
        now_in_same_unit(self.end_at, now_sec) <= self.end_at
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default, deserialize_with = "null_as_default")]
    pub plan_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub plan_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub subscription_id: String,
    #[serde(rename = "5h_limit", default, deserialize_with = "null_as_default")]
    pub limit_5h: SubscriptionLimit,
    #[serde(rename = "7d_limit", default, deserialize_with = "null_as_default")]
    pub limit_7d: SubscriptionLimit,
    #[serde(default, deserialize_with = "null_as_default")]
    pub duration: SubscriptionDuration,
    #[serde(default, deserialize_with = "flexible_i64")]
    pub owner: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    /// Fields the billing process writes that this crate does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SubscriptionItem {
    pub fn is_deployed(&self) -> bool {
        self.status == STATUS_DEPLOYED
    }

    pub fn is_usable(&self, now_sec: i64, amount: i64) -> bool {
        if !self.is_deployed() {
            return false;
        }
        if self.limit_5h.available <= 0 || self.limit_7d.available <= 0 {
            return false;
        }
        if amount > 0 && (self.limit_5h.available < amount || self.limit_7d.available < amount) {
            return false;
        }
        self.duration.contains(now_sec)
    }

    /// Stable identity of the entitlement, independent of its position and
    /// of its mutable window counters.
    pub fn fingerprint(&self) -> String {
        use sha2::Digest as _;

        let stable = format!(
            "plan_name={}|plan_id={}|subscription_id={}|owner={}|start={}|end={}",
            self.plan_name,
            self.plan_id,
            self.subscription_id,
            self.owner,
            self.duration.start_at,
            self.duration.end_at,
        );
        let mut hasher = sha2::Sha256::new();
        hasher.update(stable.as_bytes());
        hex_lower(&hasher.finalize())
    }

    /// Positive `delta` consumes, negative refunds. Consumption may not drive
    /// either window below zero; refunds are clipped at `total`.
    pub fn apply_delta(&mut self, delta: i64) -> Result<(), LedgerError> {
        let mut next_5h = self.limit_5h.available.saturating_sub(delta);
        let mut next_7d = self.limit_7d.available.saturating_sub(delta);
        if delta > 0 && (next_5h < 0 || next_7d < 0) {
            return Err(LedgerError::Exhausted);
        }
        if delta < 0 {
            next_5h = next_5h.min(self.limit_5h.total);
            next_7d = next_7d.min(self.limit_7d.total);
        }
        self.limit_5h.available = next_5h;
        self.limit_7d.available = next_7d;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SubscriptionData {
    pub items: Vec<SubscriptionItem>,
    pub last_reset_at: i64,
}

#[derive(Deserialize)]
struct SubscriptionDataObject {
    #[serde(default, deserialize_with = "null_as_default")]
    items: Vec<SubscriptionItem>,
    #[serde(default, deserialize_with = "flexible_i64")]
    last_reset_at: i64,
}

impl SubscriptionData {
    /// Decodes a stored document. The flag reports the legacy array form,
    /// which callers rewrite in the current form.
    pub fn parse(raw: &str) -> Result<(Self, bool), serde_json::Error> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok((Self::default(), false));
        }
        if trimmed.starts_with('[') {
            let items: Option<Vec<SubscriptionItem>> = serde_json::from_str(trimmed)?;
            return Ok((
                Self {
                    items: items.unwrap_or_default(),
                    last_reset_at: 0,
                },
                true,
            ));
        }
        let object: SubscriptionDataObject = serde_json::from_str(trimmed)?;
        Ok((
            Self {
                items: object.items,
                last_reset_at: object.last_reset_at,
            },
            false,
        ))
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Drops non-deployed items and rolls over every stale window. Returns
    /// whether the document changed.
    pub fn reset_and_prune(&mut self, now_sec: i64) -> bool {
        if self.items.is_empty() {
            return false;
        }
        let original_len = self.items.len();
        self.items.retain(SubscriptionItem::is_deployed);

        let mut changed = self.items.len() != original_len;
        let mut reset_occurred = false;
        for item in &mut self.items {
            for (limit, interval) in [
                (&mut item.limit_5h, FIVE_HOUR_WINDOW_SECS),
                (&mut item.limit_7d, SEVEN_DAY_WINDOW_SECS),
            ] {
                let (rolled, window_changed) = limit.roll_over(now_sec, interval);
                reset_occurred |= rolled;
                changed |= window_changed;
            }
        }
        if reset_occurred {
            self.last_reset_at = now_sec;
            changed = true;
        }
        changed
    }

    /// Debits the first usable item in stored order.
    pub fn consume_first_usable(&mut self, now_sec: i64, amount: i64) -> Option<SelectionToken> {
        if amount < 0 {
            return None;
        }
        let (index, item) = self
            .items
            .iter_mut()
            .enumerate()
            .find(|(_, item)| item.is_usable(now_sec, amount))?;
        if amount > 0 {
            item.limit_5h.available -= amount;
            item.limit_7d.available -= amount;
        }
        Some(SelectionToken::encode(item, index))
    }

    /// Resolves a token by its hint index first, then by a full scan.
    pub fn find_by_token(&self, token: &SelectionToken) -> Option<usize> {
        let (fingerprint, hint) = token.parse()?;
        if let Some(index) = hint {
            if let Some(item) = self.items.get(index) {
                if item.fingerprint() == fingerprint {
                    return Some(index);
                }
            }
        }
        self.items
            .iter()
            .position(|item| item.fingerprint() == fingerprint)
    }
}

/// Opaque handle to the item a pre-consume debited: `fp:<hex>|i:<index>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionToken(String);

impl SelectionToken {
    pub fn encode(item: &SubscriptionItem, index: usize) -> Self {
        Self(format!(
            "{TOKEN_PREFIX}{}|{TOKEN_INDEX_PREFIX}{index}",
            item.fingerprint()
        ))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parse(&self) -> Option<(&str, Option<usize>)> {
        let payload = self.0.strip_prefix(TOKEN_PREFIX)?;
        let mut parts = payload.split('|');
        let fingerprint = parts.next().filter(|fp| !fp.is_empty())?;
        let hint = parts
            .filter_map(|part| part.strip_prefix(TOKEN_INDEX_PREFIX))
            .find_map(|index| index.parse::<usize>().ok());
        Some((fingerprint, hint))
    }

    pub fn is_well_formed(&self) -> bool {
        self.parse().is_some()
    }
}

impl std::fmt::Display for SelectionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn now_in_same_unit(reference: i64, now_sec: i64) -> i64 {
    if reference > MILLIS_THRESHOLD {
        now_sec.saturating_mul(1000)
    } else {
        now_sec
    }
}

/// Next window boundary strictly after `now`, stepping whole intervals
/// from `reset_at`. A missing `reset_at` starts a window at `now`.
pub fn advance_reset_at(reset_at: i64, now_sec: i64, interval_sec: i64) -> i64 {
    if interval_sec <= 0 {
        return reset_at;
    }
    let now = now_in_same_unit(reset_at, now_sec);
    let interval = if reset_at > MILLIS_THRESHOLD {
        interval_sec.saturating_mul(1000)
    } else {
        interval_sec
    };
    if reset_at <= 0 {
        return now.saturating_add(interval);
    }
    if now <= reset_at {
        return reset_at;
    }
    let periods = (now - reset_at) / interval + 1;
    reset_at.saturating_add(periods.saturating_mul(interval))
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn flexible_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value as i64))
            .ok_or_else(|| D::Error::custom(format!("invalid int64 json value: {number}"))),
        Some(Value::String(raw)) => parse_i64_str(&raw).map_err(D::Error::custom),
        Some(other) => Err(D::Error::custom(format!(
            "invalid int64 json value: {other}"
        ))),
    }
}

fn parse_i64_str(raw: &str) -> Result<i64, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    if let Ok(value) = raw.parse::<i64>() {
        return Ok(value);
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value as i64),
        _ => Err(format!("invalid int64 string {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn item(name: &str, available_5h: i64, available_7d: i64) -> SubscriptionItem {
        SubscriptionItem {
            plan_name: name.to_string(),
            plan_id: format!("plan-{name}"),
            subscription_id: format!("sub-{name}"),
            limit_5h: SubscriptionLimit {
                total: 10,
                available: available_5h,
                reset_at: NOW + 100,
            },
            limit_7d: SubscriptionLimit {
                total: 100,
                available: available_7d,
                reset_at: NOW + 1_000,
            },
            duration: SubscriptionDuration {
                start_at: NOW - 10,
                end_at: NOW + 10_000,
                auto_renew_enabled: false,
            },
            owner: 42,
            status: STATUS_DEPLOYED.to_string(),
            extra: Map::new(),
        }
    }

    #[test]
    fn advance_reset_at_collapses_multiple_periods() {
        assert_eq!(advance_reset_at(1_000, 50_000, 18_000), 55_000);
        assert_eq!(advance_reset_at(1_000, 1_000, 18_000), 1_000);
        assert_eq!(advance_reset_at(0, 50_000, 18_000), 68_000);
    }

    #[test]
    fn advance_reset_at_keeps_millisecond_unit() {
        let reset_at_ms = (NOW - 10) * 1000;
        let next = advance_reset_at(reset_at_ms, NOW, FIVE_HOUR_WINDOW_SECS);
        assert_eq!(next, reset_at_ms + FIVE_HOUR_WINDOW_SECS * 1000);
        assert!(next > NOW * 1000);
    }

    #[test]
    fn reset_restores_available_and_moves_reset_after_now() {
        for (total, available) in [(10, 0), (10, 3), (0, 0), (7, 7)] {
            let mut data = SubscriptionData {
                items: vec![SubscriptionItem {
                    limit_5h: SubscriptionLimit {
                        total,
                        available,
                        reset_at: NOW - 3 * FIVE_HOUR_WINDOW_SECS - 5,
                    },
                    limit_7d: SubscriptionLimit {
                        total,
                        available,
                        reset_at: NOW - 1,
                    },
                    ..item("a", 0, 0)
                }],
                last_reset_at: 0,
            };
            assert!(data.reset_and_prune(NOW));
            let limit_5h = &data.items[0].limit_5h;
            let limit_7d = &data.items[0].limit_7d;
            assert_eq!(limit_5h.available, total);
            assert_eq!(limit_7d.available, total);
            assert!(limit_5h.reset_at > NOW);
            assert!(limit_7d.reset_at > NOW);
            assert_eq!(data.last_reset_at, NOW);
        }
    }

    #[test]
    fn reset_prunes_non_deployed_items() {
        let mut expired = item("gone", 1, 1);
        expired.status = "expired".to_string();
        let mut data = SubscriptionData {
            items: vec![expired, item("kept", 1, 1)],
            last_reset_at: 5,
        };
        assert!(data.reset_and_prune(NOW));
        assert_eq!(data.items.len(), 1);
        assert_eq!(data.items[0].plan_name, "kept");
        assert_eq!(data.last_reset_at, 5);

        assert!(!data.reset_and_prune(NOW));
    }

    #[test]
    fn duration_requires_both_bounds() {
        let open_start = SubscriptionDuration {
            start_at: 0,
            end_at: NOW + 10,
            auto_renew_enabled: true,
        };
        assert!(!open_start.contains(NOW));
        let open_end = SubscriptionDuration {
            start_at: NOW - 10,
            end_at: 0,
            auto_renew_enabled: false,
        };
        assert!(!open_end.contains(NOW));
    }

    #[test]
    fn duration_compares_millisecond_bounds() {
        let duration = SubscriptionDuration {
            start_at: NOW * 1000 - 1000,
            end_at: NOW * 1000 + 1000,
            auto_renew_enabled: false,
        };
        assert!(duration.contains(NOW));
        assert!(!duration.contains(NOW + 2));
    }

    #[test]
    fn consume_uses_first_eligible_item_only() {
        let mut data = SubscriptionData {
            items: vec![item("first", 1, 50), item("second", 2, 50)],
            last_reset_at: 0,
        };
        let token = data.consume_first_usable(NOW, 1).expect("eligible");
        assert_eq!(data.items[0].limit_5h.available, 0);
        assert_eq!(data.items[0].limit_7d.available, 49);
        assert_eq!(data.items[1].limit_5h.available, 2);
        assert_eq!(data.find_by_token(&token), Some(0));

        let token = data.consume_first_usable(NOW, 1).expect("second eligible");
        assert_eq!(data.items[1].limit_5h.available, 1);
        assert_eq!(data.find_by_token(&token), Some(1));
    }

    #[test]
    fn consume_with_zero_amount_requires_positive_windows() {
        let mut data = SubscriptionData {
            items: vec![item("empty", 0, 10)],
            last_reset_at: 0,
        };
        assert!(data.consume_first_usable(NOW, 0).is_none());
        data.items[0].limit_5h.available = 1;
        assert!(data.consume_first_usable(NOW, 0).is_some());
        assert_eq!(data.items[0].limit_5h.available, 1);
    }

    #[test]
    fn token_survives_reordering_and_fails_after_removal() {
        let mut data = SubscriptionData {
            items: vec![item("a", 5, 5), item("b", 5, 5)],
            last_reset_at: 0,
        };
        let token = SelectionToken::encode(&data.items[1], 1);
        assert!(token.as_str().starts_with("fp:"));
        assert!(token.as_str().ends_with("|i:1"));

        data.items.swap(0, 1);
        assert_eq!(data.find_by_token(&token), Some(0));

        data.items.remove(0);
        assert_eq!(data.find_by_token(&token), None);
        assert_eq!(data.find_by_token(&SelectionToken::from_raw("bogus")), None);
    }

    #[test]
    fn refund_restores_and_clips_at_total() {
        let mut data = SubscriptionData {
            items: vec![item("a", 10, 100)],
            last_reset_at: 0,
        };
        let token = data.consume_first_usable(NOW, 4).expect("eligible");
        let index = data.find_by_token(&token).expect("resolves");
        data.items[index].apply_delta(-4).expect("refund");
        assert_eq!(data.items[0].limit_5h.available, 10);
        assert_eq!(data.items[0].limit_7d.available, 100);

        data.items[index].apply_delta(-4).expect("duplicate refund");
        assert_eq!(data.items[0].limit_5h.available, 10);
        assert_eq!(data.items[0].limit_7d.available, 100);
    }

    #[test]
    fn extra_consumption_cannot_go_negative() {
        let mut entry = item("a", 3, 100);
        assert!(matches!(entry.apply_delta(4), Err(LedgerError::Exhausted)));
        assert_eq!(entry.limit_5h.available, 3);
        entry.apply_delta(3).expect("exact");
        assert_eq!(entry.limit_5h.available, 0);
        assert_eq!(entry.limit_7d.available, 97);
    }

    #[test]
    fn string_numbers_decode_like_numbers() {
        let from_strings: SubscriptionLimit =
            serde_json::from_value(json!({"total":"10","available":"9","reset_at":"1700000000"}))
                .expect("strings");
        let from_numbers: SubscriptionLimit =
            serde_json::from_value(json!({"total":10,"available":9,"reset_at":1700000000}))
                .expect("numbers");
        assert_eq!(from_strings, from_numbers);

        let odd: SubscriptionLimit =
            serde_json::from_value(json!({"total":"12.7","available":null,"reset_at":""}))
                .expect("odd");
        assert_eq!(odd.total, 12);
        assert_eq!(odd.available, 0);
        assert_eq!(odd.reset_at, 0);

        let bad = serde_json::from_value::<SubscriptionLimit>(json!({"total":"ten"}));
        assert!(bad.is_err());
    }

    #[test]
    fn parses_legacy_array_and_current_object() {
        let (data, legacy) = SubscriptionData::parse("").expect("empty");
        assert!(!legacy);
        assert!(data.items.is_empty());

        let (data, legacy) = SubscriptionData::parse(" null ").expect("null");
        assert!(!legacy);
        assert!(data.items.is_empty());

        let raw = r#"[{"plan_name":"pro","status":"deployed","owner":"3","5h_limit":{"total":5}}]"#;
        let (data, legacy) = SubscriptionData::parse(raw).expect("legacy");
        assert!(legacy);
        assert_eq!(data.items[0].owner, 3);
        assert_eq!(data.items[0].limit_5h.total, 5);

        let raw = r#"{"items":[{"plan_name":"pro","tier":"gold"}],"last_reset_at":"17"}"#;
        let (data, legacy) = SubscriptionData::parse(raw).expect("object");
        assert!(!legacy);
        assert_eq!(data.last_reset_at, 17);
        assert_eq!(data.items[0].extra.get("tier"), Some(&json!("gold")));

        let rewritten = data.to_json_string().expect("serialize");
        let value: Value = serde_json::from_str(&rewritten).expect("json");
        assert_eq!(value["items"][0]["tier"], "gold");
        assert_eq!(value["last_reset_at"], 17);
        assert_eq!(value["items"][0]["5h_limit"]["total"], 0);
    }
}
