use std::collections::BTreeMap;

use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::StockEntry;

/// Actor recorded on audit entries written by background jobs.
pub const SYSTEM_ACTOR: Ulid = Ulid::nil();

/// Half-open period `[start, end)` in location-local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Period {
    /// Any pair is accepted; operations reject malformed periods with
    /// `EngineError::Validation`.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    /// The calendar day as a period, for day-granularity calendar queries.
    pub fn day(date: NaiveDate) -> Self {
        let last = NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap_or(NaiveTime::MIN);
        Self::new(date.and_time(NaiveTime::MIN), date.and_time(last))
    }

    pub fn first_day(&self) -> NaiveDate {
        self.start.date()
    }

    pub fn last_day(&self) -> NaiveDate {
        self.end.date()
    }

    /// Days touched by the period as a half-open range `[first_day, last_day + 1)`.
    pub fn day_span(&self) -> (NaiveDate, NaiveDate) {
        (self.first_day(), next_day(self.last_day()))
    }

    pub fn overlaps(&self, other: &Period) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Date-only overlap: time of day is ignored, so two periods touching the
    /// same calendar day conflict even when their times do not.
    pub fn overlaps_by_date(&self, other: &Period) -> bool {
        let (a_first, a_end) = self.day_span();
        let (b_first, b_end) = other.day_span();
        a_first < b_end && b_first < a_end
    }

    pub fn conflicts(&self, other: &Period, granularity: ConflictGranularity) -> bool {
        match granularity {
            ConflictGranularity::Day => self.overlaps_by_date(other),
            ConflictGranularity::Exact => self.overlaps(other),
        }
    }

    /// True when `self` could still conflict with `query` given only its start.
    /// Monotonic in `start`, so it can drive a partition point over a sorted list.
    fn starts_before_end_of(&self, query: &Period, granularity: ConflictGranularity) -> bool {
        match granularity {
            ConflictGranularity::Day => self.first_day() <= query.last_day(),
            ConflictGranularity::Exact => self.start < query.end,
        }
    }

    pub fn days(&self) -> i64 {
        (self.last_day() - self.first_day()).num_days() + 1
    }
}

pub(crate) fn next_day(date: NaiveDate) -> NaiveDate {
    date.checked_add_days(Days::new(1)).unwrap_or(NaiveDate::MAX)
}

/// How serialized reservations are compared against each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictGranularity {
    /// Calendar days; same-day back-to-back loans of one unit conflict.
    #[default]
    Day,
    /// Exact timestamps, half-open.
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackingKind {
    Serialized,
    Bulk,
    Bundle,
}

impl TrackingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingKind::Serialized => "serialized",
            TrackingKind::Bulk => "bulk",
            TrackingKind::Bundle => "bundle",
        }
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Borrower {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetModel {
    pub id: Ulid,
    pub manufacturer: String,
    pub category: String,
    pub name: String,
    pub kind: TrackingKind,
}

/// One physical unit of a serialized model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Ulid,
    pub model_id: Ulid,
    pub location_id: Ulid,
    pub tag: Option<String>,
    pub active: bool,
    /// Loan item currently holding the unit (between hand-over and return).
    pub on_loan: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleItem {
    pub model_id: Ulid,
    pub quantity: u32,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDefinition {
    pub id: Ulid,
    pub model_id: Ulid,
    pub location_id: Ulid,
    pub items: Vec<BundleItem>,
}

impl BundleDefinition {
    pub fn required(&self) -> impl Iterator<Item = &BundleItem> {
        self.items.iter().filter(|i| !i.optional)
    }
}

// ── Inventory slots ──────────────────────────────────────────────

/// Row key for inventory: one slot per (model, location).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub model_id: Ulid,
    pub location_id: Ulid,
}

impl SlotKey {
    pub fn new(model_id: Ulid, location_id: Ulid) -> Self {
        Self { model_id, location_id }
    }
}

/// A serialized unit claimed by a loan item for the loan's period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub item_id: Ulid,
    pub loan_id: Ulid,
    pub period: Period,
}

/// Inventory of one model at one location: serialized assets plus the
/// allocations against them, or the bulk stock entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySlot {
    pub key: SlotKey,
    pub kind: TrackingKind,
    pub assets: BTreeMap<Ulid, Asset>,
    pub stock: Option<StockEntry>,
    /// Sorted by `period.start`. Derived from active loans, never persisted on its own.
    #[serde(skip)]
    pub allocations: Vec<Allocation>,
}

impl InventorySlot {
    pub fn new(key: SlotKey, kind: TrackingKind) -> Self {
        Self {
            key,
            kind,
            assets: BTreeMap::new(),
            stock: None,
            allocations: Vec::new(),
        }
    }

    pub fn active_assets(&self) -> u32 {
        self.assets.values().filter(|a| a.active).count() as u32
    }

    /// Insert allocation maintaining sort order by period.start.
    pub fn insert_allocation(&mut self, allocation: Allocation) {
        let pos = self
            .allocations
            .binary_search_by_key(&allocation.period.start, |a| a.period.start)
            .unwrap_or_else(|e| e);
        self.allocations.insert(pos, allocation);
    }

    pub fn remove_allocation(&mut self, item_id: Ulid) -> Option<Allocation> {
        let pos = self.allocations.iter().position(|a| a.item_id == item_id)?;
        Some(self.allocations.remove(pos))
    }

    pub fn remove_loan_allocations(&mut self, loan_id: Ulid) {
        self.allocations.retain(|a| a.loan_id != loan_id);
    }

    /// Allocations conflicting with the query period.
    /// Binary search skips allocations starting after the query can reach.
    pub fn overlapping<'a>(
        &'a self,
        query: &'a Period,
        granularity: ConflictGranularity,
    ) -> impl Iterator<Item = &'a Allocation> {
        let right_bound = self
            .allocations
            .partition_point(|a| a.period.starts_before_end_of(query, granularity));
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.period.conflicts(query, granularity))
    }
}

// ── Loans ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoanStatus {
    Reserved,
    HandedOver,
    Returned,
    Cancelled,
    Overdue,
}

impl LoanStatus {
    /// Loans in these states hold their serialized units.
    pub fn is_active(&self) -> bool {
        matches!(self, LoanStatus::Reserved | LoanStatus::HandedOver | LoanStatus::Overdue)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Reserved => "reserved",
            LoanStatus::HandedOver => "handed_over",
            LoanStatus::Returned => "returned",
            LoanStatus::Cancelled => "cancelled",
            LoanStatus::Overdue => "overdue",
        }
    }
}

impl std::fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemType {
    Serialized,
    Bulk,
    BundleRoot,
    BundleComponent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Reserved,
    HandedOver,
    Returned,
    Lost,
    Damaged,
}

impl ItemStatus {
    /// Still reserved or out with the borrower.
    pub fn is_open(&self) -> bool {
        matches!(self, ItemStatus::Reserved | ItemStatus::HandedOver)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    #[default]
    Good,
    Worn,
    Damaged,
    Lost,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Good => "good",
            Condition::Worn => "worn",
            Condition::Damaged => "damaged",
            Condition::Lost => "lost",
        }
    }

    pub fn settles_as(&self) -> ItemStatus {
        match self {
            Condition::Good | Condition::Worn => ItemStatus::Returned,
            Condition::Damaged => ItemStatus::Damaged,
            Condition::Lost => ItemStatus::Lost,
        }
    }

    /// Units coming back in this condition leave circulation.
    pub fn takes_out_of_service(&self) -> bool {
        matches!(self, Condition::Damaged | Condition::Lost)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanItem {
    pub id: Ulid,
    pub item_type: ItemType,
    /// Tracking kind of `model_id`.
    pub tracking: TrackingKind,
    pub asset_id: Option<Ulid>,
    pub model_id: Ulid,
    pub quantity: u32,
    pub status: ItemStatus,
    pub condition_on_handover: Option<Condition>,
    pub condition_on_return: Option<Condition>,
    pub parent_id: Option<Ulid>,
}

impl LoanItem {
    pub fn new(item_type: ItemType, tracking: TrackingKind, model_id: Ulid, quantity: u32, parent_id: Option<Ulid>) -> Self {
        Self {
            id: Ulid::new(),
            item_type,
            tracking,
            asset_id: None,
            model_id,
            quantity,
            status: ItemStatus::Reserved,
            condition_on_handover: None,
            condition_on_return: None,
            parent_id,
        }
    }

    /// A physical serialized unit must be bound at hand-over.
    pub fn needs_asset(&self) -> bool {
        self.tracking == TrackingKind::Serialized && self.item_type != ItemType::BundleRoot
    }

    /// Backed by the bulk ledger.
    pub fn is_bulk(&self) -> bool {
        self.tracking == TrackingKind::Bulk && self.item_type != ItemType::BundleRoot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanEventKind {
    Reserved,
    Cancelled,
    HandedOver,
    Returned,
    Overdue,
    Amended,
}

impl LoanEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanEventKind::Reserved => "reserved",
            LoanEventKind::Cancelled => "cancelled",
            LoanEventKind::HandedOver => "handed_over",
            LoanEventKind::Returned => "returned",
            LoanEventKind::Overdue => "overdue",
            LoanEventKind::Amended => "amended",
        }
    }
}

/// Audit trail entry. Appended, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanEvent {
    pub id: Ulid,
    pub kind: LoanEventKind,
    pub actor: Ulid,
    pub at: NaiveDateTime,
    pub note: Option<String>,
    /// JSON object with transition details.
    pub details: String,
}

impl LoanEvent {
    pub fn details_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.details).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub id: Ulid,
    pub borrower_id: Ulid,
    pub location_id: Ulid,
    pub period: Period,
    pub status: LoanStatus,
    pub notes: Option<String>,
    pub items: Vec<LoanItem>,
    pub history: Vec<LoanEvent>,
}

impl Loan {
    pub fn item(&self, id: Ulid) -> Option<&LoanItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn item_mut(&mut self, id: Ulid) -> Option<&mut LoanItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }

    pub fn components_of(&self, root_id: Ulid) -> impl Iterator<Item = &LoanItem> {
        self.items.iter().filter(move |i| i.parent_id == Some(root_id))
    }

    /// Items still reserved or handed over.
    pub fn open_items(&self) -> usize {
        self.items.iter().filter(|i| i.status.is_open()).count()
    }

    /// Slots holding this loan's serialized allocations.
    pub fn allocation_keys(&self) -> Vec<SlotKey> {
        let mut keys: Vec<SlotKey> = self
            .items
            .iter()
            .filter(|i| i.needs_asset())
            .map(|i| SlotKey::new(i.model_id, self.location_id))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Every slot any item of this loan draws from.
    pub fn slot_keys(&self) -> Vec<SlotKey> {
        let mut keys: Vec<SlotKey> = self
            .items
            .iter()
            .filter(|i| i.item_type != ItemType::BundleRoot)
            .map(|i| SlotKey::new(i.model_id, self.location_id))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

// ── Requests ─────────────────────────────────────────────────────

/// One requested line: a model and how many units of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRequest {
    pub model_id: Ulid,
    pub quantity: u32,
    /// Optional bundle components to include; ignored for non-bundle models.
    #[serde(default)]
    pub optional: Vec<Ulid>,
}

impl ItemRequest {
    pub fn new(model_id: Ulid, quantity: u32) -> Self {
        Self { model_id, quantity, optional: Vec::new() }
    }
}

/// Asset binding for one loan item at hand-over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverLine {
    pub item_id: Ulid,
    pub asset_id: Option<Ulid>,
    pub condition: Option<Condition>,
}

/// Reported condition of one loan item at return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnLine {
    pub item_id: Ulid,
    pub condition: Condition,
}

// ── Log records ──────────────────────────────────────────────────

/// Log entries. A committed transaction is one WAL record holding its
/// events in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LocationRegistered {
        location: Location,
    },
    BorrowerRegistered {
        borrower: Borrower,
    },
    ModelRegistered {
        model: AssetModel,
    },
    BundleDefined {
        definition: BundleDefinition,
    },
    AssetRegistered {
        asset: Asset,
    },
    AssetActivationChanged {
        key: SlotKey,
        asset_id: Ulid,
        active: bool,
    },
    StockTotalSet {
        key: SlotKey,
        total: u32,
    },
    StockTaken {
        key: SlotKey,
        quantity: u32,
    },
    StockReleased {
        key: SlotKey,
        quantity: u32,
    },
    StockWrittenOff {
        key: SlotKey,
        quantity: u32,
    },
    LoanReserved {
        id: Ulid,
        borrower_id: Ulid,
        location_id: Ulid,
        period: Period,
        notes: Option<String>,
    },
    LoanItemAllocated {
        loan_id: Ulid,
        item: LoanItem,
    },
    LoanItemRemoved {
        loan_id: Ulid,
        item_id: Ulid,
    },
    LoanItemModelChanged {
        loan_id: Ulid,
        item_id: Ulid,
        model_id: Ulid,
    },
    /// Hand-over of one item: the serialized unit bound to it, if any, and its condition.
    ItemBound {
        loan_id: Ulid,
        item_id: Ulid,
        asset_id: Option<Ulid>,
        condition: Option<Condition>,
    },
    LoanHandedOver {
        loan_id: Ulid,
    },
    LoanItemSettled {
        loan_id: Ulid,
        item_id: Ulid,
        status: ItemStatus,
        condition: Option<Condition>,
    },
    LoanReturned {
        loan_id: Ulid,
    },
    LoanCancelled {
        loan_id: Ulid,
    },
    LoanMarkedOverdue {
        loan_id: Ulid,
    },
    LoanPeriodChanged {
        loan_id: Ulid,
        period: Period,
    },
    AuditAppended {
        loan_id: Ulid,
        entry: LoanEvent,
    },
    /// Compaction snapshot of a slot (assets and stock; allocations are rebuilt from loans).
    SlotRestored {
        slot: InventorySlot,
    },
    /// Compaction snapshot of a loan.
    LoanRestored {
        loan: Loan,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLevel {
    pub model_id: Ulid,
    pub location_id: Ulid,
    pub total: u32,
    pub available: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub free: u32,
}
