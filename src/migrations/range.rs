//! # Key Ranges
//!
//! A mapper's record set is too large for one work unit, so the key space is
//! cut into disjoint, ordered, half-open ranges `[lower, upper)` and each
//! range becomes its own unit. The first range has no lower bound and the last
//! no upper bound, so together they cover every key, including keys written
//! after the split.
//!
//! How to cut depends on how keys are distributed; a [`KeySplitter`] is chosen
//! from the record set's [`KeyKind`] unless the migration supplies its own.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{StoreError, StoreResult};

/// Key of one item in a mapper's record set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemKey {
    Int(i64),
    Uuid(Uuid),
    Name(String),
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Uuid(u) => write!(f, "{}", u),
            Self::Name(s) => write!(f, "{:?}", s),
        }
    }
}

/// Shape of a record set's keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Densely allocated integers (auto-increment)
    SequentialInt,
    /// Integers spread over the whole i64 space
    ScatteredInt,
    /// Free-form string names
    Name,
    /// Random UUIDs
    Uuid,
}

/// Half-open key range `[lower, upper)`; `None` means unbounded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub lower: Option<ItemKey>,
    pub upper: Option<ItemKey>,
}

impl KeyRange {
    /// Range covering every key
    pub fn full() -> Self {
        Self {
            lower: None,
            upper: None,
        }
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        self.lower.as_ref().map_or(true, |lower| key >= lower)
            && self.upper.as_ref().map_or(true, |upper| key < upper)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lower {
            Some(lower) => write!(f, "[{}, ", lower)?,
            None => write!(f, "(-inf, ")?,
        }
        match &self.upper {
            Some(upper) => write!(f, "{})", upper),
            None => write!(f, "+inf)"),
        }
    }
}

/// One item handed to a mapper operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapperItem {
    pub key: ItemKey,
    pub value: serde_json::Value,
}

/// The set of items a mapper migration visits
pub trait RecordSet: Send + Sync {
    fn key_kind(&self) -> KeyKind;

    /// Smallest and largest key currently present, `None` when empty
    fn key_bounds(&self) -> StoreResult<Option<(ItemKey, ItemKey)>>;

    /// Items whose key falls in `range`, in key order
    fn fetch(&self, range: &KeyRange) -> StoreResult<Vec<MapperItem>>;
}

/// Cuts a key space into at most `shards` ranges
pub trait KeySplitter: Send + Sync {
    fn split(&self, bounds: Option<&(ItemKey, ItemKey)>, shards: usize) -> Vec<KeyRange>;
}

impl<F> KeySplitter for F
where
    F: Fn(Option<&(ItemKey, ItemKey)>, usize) -> Vec<KeyRange> + Send + Sync,
{
    fn split(&self, bounds: Option<&(ItemKey, ItemKey)>, shards: usize) -> Vec<KeyRange> {
        self(bounds, shards)
    }
}

/// Build consecutive ranges around sorted boundaries
fn ranges_from_boundaries(mut boundaries: Vec<ItemKey>) -> Vec<KeyRange> {
    boundaries.sort();
    boundaries.dedup();

    let mut ranges = Vec::with_capacity(boundaries.len() + 1);
    let mut lower = None;
    for boundary in boundaries {
        ranges.push(KeyRange {
            lower: lower.take(),
            upper: Some(boundary.clone()),
        });
        lower = Some(boundary);
    }
    ranges.push(KeyRange { lower, upper: None });
    ranges
}

/// Evenly spaced cut points strictly inside `[start, start + span)`
fn cut_points(start: i128, span: i128, shards: usize) -> Vec<i128> {
    let shards = (shards.max(1) as i128).min(span.max(1));
    let step = span / shards;
    (1..shards).map(|i| start + i * step).collect()
}

/// Splits the observed `[min, max]` of densely allocated integer keys
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialIntRanges;

impl KeySplitter for SequentialIntRanges {
    fn split(&self, bounds: Option<&(ItemKey, ItemKey)>, shards: usize) -> Vec<KeyRange> {
        let Some((ItemKey::Int(min), ItemKey::Int(max))) = bounds else {
            return vec![KeyRange::full()];
        };
        let (min, max) = (*min as i128, *max as i128);
        let span = max - min + 1;
        let boundaries = cut_points(min, span, shards)
            .into_iter()
            .map(|p| ItemKey::Int(p as i64))
            .collect();
        ranges_from_boundaries(boundaries)
    }
}

/// Splits the whole i64 space; for keys scattered without locality
#[derive(Debug, Clone, Copy, Default)]
pub struct ScatteredIntRanges;

impl KeySplitter for ScatteredIntRanges {
    fn split(&self, _bounds: Option<&(ItemKey, ItemKey)>, shards: usize) -> Vec<KeyRange> {
        let span = 1i128 << 64;
        let boundaries = cut_points(i64::MIN as i128, span, shards)
            .into_iter()
            .map(|p| ItemKey::Int(p as i64))
            .collect();
        ranges_from_boundaries(boundaries)
    }
}

/// Splits names on their first character across printable ASCII
#[derive(Debug, Clone, Copy, Default)]
pub struct NameRanges;

impl NameRanges {
    const FIRST: u8 = 0x20;
    const LAST: u8 = 0x7e;
}

impl KeySplitter for NameRanges {
    fn split(&self, _bounds: Option<&(ItemKey, ItemKey)>, shards: usize) -> Vec<KeyRange> {
        let span = (Self::LAST - Self::FIRST + 1) as i128;
        let boundaries = cut_points(Self::FIRST as i128, span, shards)
            .into_iter()
            .map(|p| ItemKey::Name(char::from(p as u8).to_string()))
            .collect();
        ranges_from_boundaries(boundaries)
    }
}

/// Splits the 128-bit UUID space evenly
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidRanges;

impl KeySplitter for UuidRanges {
    fn split(&self, _bounds: Option<&(ItemKey, ItemKey)>, shards: usize) -> Vec<KeyRange> {
        let shards = shards.max(1) as u128;
        let step = u128::MAX / shards;
        let boundaries = (1..shards)
            .map(|i| ItemKey::Uuid(Uuid::from_u128(i * step)))
            .collect();
        ranges_from_boundaries(boundaries)
    }
}

/// Default splitter for a key kind
pub fn default_splitter(kind: KeyKind) -> Arc<dyn KeySplitter> {
    match kind {
        KeyKind::SequentialInt => Arc::new(SequentialIntRanges),
        KeyKind::ScatteredInt => Arc::new(ScatteredIntRanges),
        KeyKind::Name => Arc::new(NameRanges),
        KeyKind::Uuid => Arc::new(UuidRanges),
    }
}

/// Ordered in-memory record set
pub struct InMemoryRecordSet {
    kind: KeyKind,
    items: RwLock<BTreeMap<ItemKey, serde_json::Value>>,
}

impl InMemoryRecordSet {
    pub fn new(kind: KeyKind) -> Self {
        Self {
            kind,
            items: RwLock::new(BTreeMap::new()),
        }
    }

    /// Integer-keyed set `1..=count` with a `{"n": key}` payload
    pub fn sequential(count: i64) -> Self {
        let set = Self::new(KeyKind::SequentialInt);
        for n in 1..=count {
            set.insert(ItemKey::Int(n), serde_json::json!({ "n": n }));
        }
        set
    }

    pub fn insert(&self, key: ItemKey, value: serde_json::Value) {
        if let Ok(mut items) = self.items.write() {
            items.insert(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordSet for InMemoryRecordSet {
    fn key_kind(&self) -> KeyKind {
        self.kind
    }

    fn key_bounds(&self) -> StoreResult<Option<(ItemKey, ItemKey)>> {
        let items = self.items.read().map_err(|_| StoreError::poisoned())?;
        let first = items.keys().next().cloned();
        let last = items.keys().next_back().cloned();
        Ok(first.zip(last))
    }

    fn fetch(&self, range: &KeyRange) -> StoreResult<Vec<MapperItem>> {
        let items = self.items.read().map_err(|_| StoreError::poisoned())?;
        Ok(items
            .iter()
            .filter(|(key, _)| range.contains(key))
            .map(|(key, value)| MapperItem {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every key lands in exactly one range
    fn assert_partitions(ranges: &[KeyRange], keys: &[ItemKey]) {
        for key in keys {
            let hits = ranges.iter().filter(|r| r.contains(key)).count();
            assert_eq!(hits, 1, "key {} covered by {} ranges", key, hits);
        }
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].upper, pair[1].lower);
        }
        assert!(ranges.first().unwrap().lower.is_none());
        assert!(ranges.last().unwrap().upper.is_none());
    }

    #[test]
    fn test_sequential_split_is_even() {
        let bounds = (ItemKey::Int(1), ItemKey::Int(10_000));
        let ranges = SequentialIntRanges.split(Some(&bounds), 4);
        assert_eq!(ranges.len(), 4);

        let set = InMemoryRecordSet::sequential(10_000);
        let sizes: Vec<_> = ranges.iter().map(|r| set.fetch(r).unwrap().len()).collect();
        assert_eq!(sizes, vec![2_500, 2_500, 2_500, 2_500]);

        let keys: Vec<_> = (-5..10_010).map(ItemKey::Int).collect();
        assert_partitions(&ranges, &keys);
    }

    #[test]
    fn test_sequential_split_caps_shards_at_span() {
        let bounds = (ItemKey::Int(5), ItemKey::Int(7));
        let ranges = SequentialIntRanges.split(Some(&bounds), 32);
        assert_eq!(ranges.len(), 3);
    }

    #[test]
    fn test_empty_set_gets_one_full_range() {
        assert_eq!(SequentialIntRanges.split(None, 8), vec![KeyRange::full()]);
    }

    #[test]
    fn test_scattered_split_covers_extremes() {
        let ranges = ScatteredIntRanges.split(None, 8);
        assert_eq!(ranges.len(), 8);
        assert_partitions(
            &ranges,
            &[
                ItemKey::Int(i64::MIN),
                ItemKey::Int(-1),
                ItemKey::Int(0),
                ItemKey::Int(i64::MAX),
            ],
        );
    }

    #[test]
    fn test_uuid_split() {
        let ranges = UuidRanges.split(None, 16);
        assert_eq!(ranges.len(), 16);
        let keys: Vec<_> = (0..200).map(|_| ItemKey::Uuid(Uuid::new_v4())).collect();
        assert_partitions(&ranges, &keys);
    }

    #[test]
    fn test_name_split() {
        let ranges = NameRanges.split(None, 4);
        assert_eq!(ranges.len(), 4);
        let keys: Vec<_> = ["", "\u{1}", "alpha", "Zulu", "~tilde", "\u{e9}t\u{e9}"]
            .iter()
            .map(|s| ItemKey::Name(s.to_string()))
            .collect();
        assert_partitions(&ranges, &keys);
    }

    #[test]
    fn test_closure_splitter() {
        let halves = |_: Option<&(ItemKey, ItemKey)>, _: usize| {
            vec![
                KeyRange {
                    lower: None,
                    upper: Some(ItemKey::Int(0)),
                },
                KeyRange {
                    lower: Some(ItemKey::Int(0)),
                    upper: None,
                },
            ]
        };
        let splitter: Arc<dyn KeySplitter> = Arc::new(halves);
        assert_eq!(splitter.split(None, 99).len(), 2);
    }

    #[test]
    fn test_range_display() {
        let range = KeyRange {
            lower: Some(ItemKey::Int(10)),
            upper: None,
        };
        assert_eq!(range.to_string(), "[10, +inf)");
    }
}
