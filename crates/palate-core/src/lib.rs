use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

/// Upper bound on how many existing items a new item is ever compared against.
pub const MAX_COMPARISONS: usize = 6;

pub const TOP_SCORE: f64 = 10.0;
pub const FLOOR_SCORE: f64 = 3.0;

const TAIL_START_RANK: u32 = 20;
const TAIL_START_SCORE: f64 = 5.0;
const MIN_TAIL_COLLECTION: usize = 50;

const MIN_DECISIVE_COMPARISONS: u32 = 3;
const EARLY_STOP_CONFIDENCE: f64 = 0.7;
const RECENT_ITEMS_LIMIT: usize = 5;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("invalid rank {rank}: expected a value in 1..={max}")]
    InvalidRank { rank: u32, max: u32 },
    #[error("item {item_id} not found in category {category}")]
    ItemNotFound { category: Category, item_id: ItemId },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("repository error: {0}")]
    Repository(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Accept a caller-supplied identifier.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the identifier is blank.
    pub fn parse(value: &str) -> Result<Self, KernelError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(KernelError::Validation("item id MUST be non-empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ItemId {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

/// A named collection of items ranked against each other, e.g. `wine`.
/// Deserializing goes through [`Category::parse`], so stored names are
/// always normalized.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Category(String);

impl Category {
    /// Normalize a category name (trimmed, lowercase).
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the name is empty or contains
    /// characters other than ASCII letters, digits, `-` and `_`.
    pub fn parse(value: &str) -> Result<Self, KernelError> {
        let normalized = value.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(KernelError::Validation("category MUST be non-empty".to_string()));
        }
        if !normalized.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_') {
            return Err(KernelError::Validation(format!(
                "category `{normalized}` MUST contain only letters, digits, '-' or '_'"
            )));
        }
        Ok(Self(normalized))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Category {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Category> for String {
    fn from(category: Category) -> Self {
        category.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct TastingMemory {
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub place: Option<String>,
    #[serde(rename = "when", default, skip_serializing_if = "Option::is_none")]
    pub occasion: Option<String>,
    #[serde(rename = "with", default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
}

impl TastingMemory {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.place.is_none() && self.occasion.is_none() && self.company.is_none()
    }
}

/// Descriptive payload owned by the application. The engine never reads it
/// beyond validating that a name is present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ItemDetails {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "TastingMemory::is_empty")]
    pub memory: TastingMemory,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ItemDetails {
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self { name: name.to_string(), ..Self::default() }
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] when the name is blank.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.name.trim().is_empty() {
            return Err(KernelError::Validation("name MUST be provided for every item".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedItem {
    pub id: ItemId,
    pub category: Category,
    pub rank: u32,
    pub score: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    pub details: ItemDetails,
}

/// A candidate that has not been ranked yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub id: Option<ItemId>,
    pub details: ItemDetails,
    pub created_at: Option<OffsetDateTime>,
}

impl NewItem {
    #[must_use]
    pub fn new(details: ItemDetails) -> Self {
        Self { id: None, details, created_at: None }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Choice {
    PreferNew,
    PreferExisting,
    Skipped,
}

impl Choice {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreferNew => "prefer_new",
            Self::PreferExisting => "prefer_existing",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "prefer_new" | "new" => Some(Self::PreferNew),
            "prefer_existing" | "existing" => Some(Self::PreferExisting),
            "skipped" | "skip" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ComparisonOutcome {
    pub compared_item_id: ItemId,
    pub choice: Choice,
}

impl ComparisonOutcome {
    #[must_use]
    pub fn prefer_new(compared_item_id: ItemId) -> Self {
        Self { compared_item_id, choice: Choice::PreferNew }
    }

    #[must_use]
    pub fn prefer_existing(compared_item_id: ItemId) -> Self {
        Self { compared_item_id, choice: Choice::PreferExisting }
    }

    #[must_use]
    pub fn skipped(compared_item_id: ItemId) -> Self {
        Self { compared_item_id, choice: Choice::Skipped }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ComparisonTally {
    pub wins: u32,
    pub losses: u32,
    pub skipped: u32,
}

impl ComparisonTally {
    #[must_use]
    pub fn from_outcomes(outcomes: &[ComparisonOutcome]) -> Self {
        let mut tally = Self::default();
        for outcome in outcomes {
            match outcome.choice {
                Choice::PreferNew => tally.wins += 1,
                Choice::PreferExisting => tally.losses += 1,
                Choice::Skipped => tally.skipped += 1,
            }
        }
        tally
    }

    #[must_use]
    pub fn decisive(self) -> u32 {
        self.wins + self.losses
    }

    /// Share of decisive outcomes agreeing with the majority, 0.0 when none.
    #[must_use]
    pub fn confidence(self) -> f64 {
        let decisive = self.decisive();
        if decisive == 0 {
            return 0.0;
        }
        f64::from(self.wins.max(self.losses)) / f64::from(decisive)
    }
}

/// Positions (0-based, ascending rank) of the existing items a new item should
/// be compared against. Small collections are compared exhaustively; larger
/// ones are sampled at fixed anchors so the user never sees more than
/// [`MAX_COMPARISONS`] prompts.
#[must_use]
pub fn comparison_indices(len: usize) -> Vec<usize> {
    let anchors = match len {
        0..=5 => return (0..len).collect(),
        6..=10 => vec![0, 1, 2, len / 2, len - 2, len - 1],
        _ => vec![0, len / 4, len / 2, len * 3 / 4, len - 1],
    };

    let mut seen = BTreeSet::new();
    anchors.into_iter().filter(|index| seen.insert(*index)).collect()
}

/// Pick the comparison set from items already sorted by ascending rank.
#[must_use]
pub fn select_comparison_set(items_by_rank: &[RankedItem]) -> Vec<&RankedItem> {
    comparison_indices(items_by_rank.len())
        .into_iter()
        .filter_map(|index| items_by_rank.get(index))
        .collect()
}

fn count_as_rank(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Insertion slot used when a session ends without a single decisive answer.
#[must_use]
pub fn median_rank(existing_count: usize) -> u32 {
    count_as_rank(existing_count).div_ceil(2).max(1)
}

/// Map a win/loss tally onto an insertion rank in `1..=existing_count + 1`.
#[must_use]
pub fn estimate_rank_from_tally(tally: ComparisonTally, existing_count: usize) -> u32 {
    let last_slot = count_as_rank(existing_count).saturating_add(1);
    match existing_count {
        0 => 1,
        1 => {
            if tally.wins > tally.losses {
                1
            } else {
                2
            }
        }
        _ => {
            let decisive = u64::from(tally.decisive());
            if decisive == 0 {
                return median_rank(existing_count);
            }
            // ceil((1 - wins/decisive) * slots) == ceil(losses * slots / decisive)
            let estimate = (u64::from(tally.losses) * u64::from(last_slot)).div_ceil(decisive);
            u32::try_from(estimate).unwrap_or(last_slot).clamp(1, last_slot)
        }
    }
}

/// Estimate where a new item belongs from the answers collected so far. A
/// partial (skipped or aborted) sequence is valid input.
#[must_use]
pub fn estimate_insertion_rank(outcomes: &[ComparisonOutcome], existing_count: usize) -> u32 {
    estimate_rank_from_tally(ComparisonTally::from_outcomes(outcomes), existing_count)
}

/// Fixed decay curve from rank to a 0-10 score. Steep at the top, flat in the
/// long tail; the tail slope assumes at least 50 items so small collections do
/// not collapse towards the floor. Ranks are 1-based; `0` scores as rank 1.
#[must_use]
pub fn score_from_rank(rank: u32, total_items: usize) -> f64 {
    match rank {
        0 | 1 => TOP_SCORE,
        2 => 9.5,
        3 => 9.0,
        4 => 8.5,
        5 => 8.0,
        6..=10 => 8.0 - f64::from(rank - 5) * 0.3,
        11..=20 => 6.5 - f64::from(rank - 10) * 0.15,
        _ => {
            let tail_len = count_as_rank(total_items.max(MIN_TAIL_COLLECTION)) - TAIL_START_RANK;
            let decline_per_rank = 2.0 / f64::from(tail_len);
            (TAIL_START_SCORE - f64::from(rank - TAIL_START_RANK) * decline_per_rank)
                .max(FLOOR_SCORE)
        }
    }
}

#[must_use]
pub fn format_score(score: f64) -> String {
    format!("{score:.1}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScoreTier {
    Exceptional,
    Excellent,
    Great,
    Good,
    Decent,
    Fair,
}

impl ScoreTier {
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 9.0 {
            Self::Exceptional
        } else if score >= 8.0 {
            Self::Excellent
        } else if score >= 7.0 {
            Self::Great
        } else if score >= 6.0 {
            Self::Good
        } else if score >= 5.0 {
            Self::Decent
        } else {
            Self::Fair
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exceptional => "exceptional",
            Self::Excellent => "excellent",
            Self::Great => "great",
            Self::Good => "good",
            Self::Decent => "decent",
            Self::Fair => "fair",
        }
    }
}

fn by_rank(lhs: &RankedItem, rhs: &RankedItem) -> Ordering {
    lhs.rank
        .cmp(&rhs.rank)
        .then_with(|| lhs.created_at.cmp(&rhs.created_at))
        .then_with(|| lhs.id.cmp(&rhs.id))
}

/// Assign ranks `1..=N` by position and refresh every score.
fn renumber(items: &mut [RankedItem]) {
    let total = items.len();
    for (index, item) in items.iter_mut().enumerate() {
        item.rank = count_as_rank(index + 1);
        item.score = score_from_rank(item.rank, total);
    }
}

/// Sort a category by rank and rebuild ranks and scores from first
/// principles. Gaps and duplicate ranks in the input are closed up, ties
/// broken by creation time then id.
#[must_use]
pub fn recalculate_scores(mut items: Vec<RankedItem>) -> Vec<RankedItem> {
    items.sort_by(by_rank);
    renumber(&mut items);
    items
}

/// Verify that ranks are exactly `1..=N` and scores match the curve.
///
/// # Errors
/// Returns [`KernelError::Validation`] describing the first violation found.
pub fn check_contiguity(items: &[RankedItem]) -> Result<(), KernelError> {
    let mut sorted = items.iter().collect::<Vec<_>>();
    sorted.sort_by(|lhs, rhs| by_rank(lhs, rhs));
    let total = items.len();

    for (index, item) in sorted.iter().enumerate() {
        let expected = count_as_rank(index + 1);
        if item.rank != expected {
            return Err(KernelError::Validation(format!(
                "rank sequence broken at position {expected}: item {} holds rank {}",
                item.id, item.rank
            )));
        }
        let expected_score = score_from_rank(expected, total);
        if item.score.to_bits() != expected_score.to_bits() {
            return Err(KernelError::Validation(format!(
                "item {} at rank {expected} has score {} but the curve gives {expected_score}",
                item.id, item.score
            )));
        }
    }

    Ok(())
}

/// Persistence collaborator. `save_items` replaces a category's whole
/// collection atomically; an empty slice removes the category.
pub trait ItemRepository {
    /// # Errors
    /// Returns [`KernelError::Repository`] when the backing store fails.
    fn load_items(&self, category: &Category) -> Result<Vec<RankedItem>, KernelError>;

    /// # Errors
    /// Returns [`KernelError::Repository`] when the backing store fails.
    fn save_items(&mut self, category: &Category, items: &[RankedItem]) -> Result<(), KernelError>;

    /// # Errors
    /// Returns [`KernelError::Repository`] when the backing store fails.
    fn categories(&self) -> Result<Vec<Category>, KernelError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    collections: BTreeMap<Category, Vec<RankedItem>>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ItemRepository for MemoryRepository {
    fn load_items(&self, category: &Category) -> Result<Vec<RankedItem>, KernelError> {
        Ok(self.collections.get(category).cloned().unwrap_or_default())
    }

    fn save_items(&mut self, category: &Category, items: &[RankedItem]) -> Result<(), KernelError> {
        if items.is_empty() {
            self.collections.remove(category);
        } else {
            self.collections.insert(category.clone(), items.to_vec());
        }
        Ok(())
    }

    fn categories(&self) -> Result<Vec<Category>, KernelError> {
        Ok(self.collections.keys().cloned().collect())
    }
}

/// One insertion's worth of pairwise answers against a fixed comparison plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonSession {
    category: Category,
    existing_count: usize,
    planned: Vec<ItemId>,
    outcomes: Vec<ComparisonOutcome>,
}

impl ComparisonSession {
    /// Plan a session against a category's items sorted by ascending rank.
    #[must_use]
    pub fn begin(category: Category, items_by_rank: &[RankedItem]) -> Self {
        let planned =
            select_comparison_set(items_by_rank).into_iter().map(|item| item.id.clone()).collect();
        Self { category, existing_count: items_by_rank.len(), planned, outcomes: Vec::new() }
    }

    #[must_use]
    pub fn category(&self) -> &Category {
        &self.category
    }

    #[must_use]
    pub fn planned(&self) -> &[ItemId] {
        &self.planned
    }

    #[must_use]
    pub fn outcomes(&self) -> &[ComparisonOutcome] {
        &self.outcomes
    }

    /// The existing item the user should be shown next, if any.
    #[must_use]
    pub fn current(&self) -> Option<&ItemId> {
        self.planned.get(self.outcomes.len())
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcomes.len() >= self.planned.len()
    }

    #[must_use]
    pub fn tally(&self) -> ComparisonTally {
        ComparisonTally::from_outcomes(&self.outcomes)
    }

    /// Record the answer for the current item.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when every planned comparison has
    /// already been answered.
    pub fn record(&mut self, choice: Choice) -> Result<&ComparisonOutcome, KernelError> {
        let Some(current) = self.current().cloned() else {
            return Err(KernelError::Validation(
                "comparison session has no remaining comparisons".to_string(),
            ));
        };
        self.outcomes.push(ComparisonOutcome { compared_item_id: current, choice });
        self.outcomes.last().ok_or_else(|| {
            KernelError::Validation("comparison outcome was not recorded".to_string())
        })
    }

    /// # Errors
    /// See [`ComparisonSession::record`].
    pub fn skip(&mut self) -> Result<&ComparisonOutcome, KernelError> {
        self.record(Choice::Skipped)
    }

    /// Recorded answers plus the ones they imply. The plan runs from the top
    /// rank down, so once the new item has beaten one planned item it also
    /// beats every planned item still waiting. Losses imply nothing about
    /// lower-ranked items.
    #[must_use]
    pub fn projected_tally(&self) -> ComparisonTally {
        let mut tally = self.tally();
        if tally.wins > 0 {
            let remaining = self.planned.len().saturating_sub(self.outcomes.len());
            tally.wins = tally.wins.saturating_add(u32::try_from(remaining).unwrap_or(u32::MAX));
        }
        tally
    }

    /// At least three decisive answers including a win, then stop as soon as
    /// they agree strongly enough; otherwise work through the whole plan.
    /// Without a win the unanswered bottom of the plan is still open.
    #[must_use]
    pub fn needs_more_comparisons(&self) -> bool {
        if self.is_complete() {
            return false;
        }
        let tally = self.tally();
        if tally.decisive() < MIN_DECISIVE_COMPARISONS || tally.wins == 0 {
            return true;
        }
        tally.confidence() < EARLY_STOP_CONFIDENCE
    }

    /// Rank estimate against the collection size the session was planned for.
    #[must_use]
    pub fn estimated_rank(&self) -> u32 {
        estimate_rank_from_tally(self.projected_tally(), self.existing_count)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryStats {
    pub category: Category,
    pub total_items: usize,
    pub average_score: f64,
    pub top_item: Option<RankedItem>,
    pub recent_items: Vec<RankedItem>,
}

/// Owns rank and score for every category in the injected repository. Each
/// mutation loads the category, rebuilds it from first principles, and saves
/// the whole collection back in one call.
#[derive(Debug)]
pub struct RankingEngine<R> {
    repository: R,
}

impl<R: ItemRepository> RankingEngine<R> {
    #[must_use]
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn repository_mut(&mut self) -> &mut R {
        &mut self.repository
    }

    pub fn into_repository(self) -> R {
        self.repository
    }

    /// Items of one category sorted by rank, with ranks and scores normalized.
    ///
    /// # Errors
    /// Returns [`KernelError::Repository`] when loading fails.
    pub fn items(&self, category: &Category) -> Result<Vec<RankedItem>, KernelError> {
        Ok(recalculate_scores(self.repository.load_items(category)?))
    }

    /// # Errors
    /// Returns [`KernelError::Repository`] when listing fails.
    pub fn categories(&self) -> Result<Vec<Category>, KernelError> {
        self.repository.categories()
    }

    /// # Errors
    /// Returns [`KernelError::Repository`] when loading fails.
    pub fn begin_session(&self, category: &Category) -> Result<ComparisonSession, KernelError> {
        let items = self.items(category)?;
        Ok(ComparisonSession::begin(category.clone(), &items))
    }

    /// Insert a candidate at `rank`, pushing every item at or below it down
    /// one place.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidRank`] when `rank` is outside
    /// `1..=count + 1`, [`KernelError::Validation`] for an invalid payload or a
    /// duplicate id, and [`KernelError::Repository`] on persistence failure.
    /// Nothing is written on error.
    pub fn insert(
        &mut self,
        category: &Category,
        candidate: NewItem,
        rank: u32,
    ) -> Result<RankedItem, KernelError> {
        candidate.details.validate()?;
        let mut items = self.items(category)?;
        let max = count_as_rank(items.len()).saturating_add(1);
        if rank == 0 || rank > max {
            return Err(KernelError::InvalidRank { rank, max });
        }

        let id = candidate.id.unwrap_or_else(ItemId::generate);
        if items.iter().any(|item| item.id == id) {
            return Err(KernelError::Validation(format!(
                "item id {id} already exists in category {category}"
            )));
        }

        let index = usize::try_from(rank - 1).unwrap_or(items.len()).min(items.len());
        items.insert(
            index,
            RankedItem {
                id: id.clone(),
                category: category.clone(),
                rank,
                score: TOP_SCORE,
                created_at: candidate.created_at.unwrap_or_else(OffsetDateTime::now_utc),
                updated_at: None,
                details: candidate.details,
            },
        );
        renumber(&mut items);
        self.repository.save_items(category, &items)?;

        let inserted = find_item(&items, category, &id)?;
        tracing::info!(
            category = %category,
            item_id = %inserted.id,
            rank = inserted.rank,
            score = inserted.score,
            total = items.len(),
            "inserted ranked item"
        );
        Ok(inserted)
    }

    /// Insert using the rank estimated from a finished (or abandoned)
    /// session. The estimate is taken against the category's current size.
    ///
    /// # Errors
    /// Same as [`RankingEngine::insert`].
    pub fn insert_from_session(
        &mut self,
        session: &ComparisonSession,
        candidate: NewItem,
    ) -> Result<RankedItem, KernelError> {
        let existing = self.repository.load_items(session.category())?.len();
        let tally = session.projected_tally();
        let rank = estimate_rank_from_tally(tally, existing);
        tracing::debug!(
            category = %session.category(),
            wins = tally.wins,
            losses = tally.losses,
            skipped = tally.skipped,
            rank,
            "estimated insertion rank"
        );
        self.insert(session.category(), candidate, rank)
    }

    /// Remove an item and close the gap it leaves. Returns `false` without
    /// writing anything when the id is unknown.
    ///
    /// # Errors
    /// Returns [`KernelError::Repository`] on persistence failure.
    pub fn delete(&mut self, category: &Category, item_id: &ItemId) -> Result<bool, KernelError> {
        let mut items = self.items(category)?;
        let Some(index) = items.iter().position(|item| &item.id == item_id) else {
            tracing::debug!(category = %category, item_id = %item_id, "delete of unknown item ignored");
            return Ok(false);
        };

        let removed = items.remove(index);
        renumber(&mut items);
        self.repository.save_items(category, &items)?;
        tracing::info!(
            category = %category,
            item_id = %item_id,
            old_rank = removed.rank,
            remaining = items.len(),
            "deleted ranked item"
        );
        Ok(true)
    }

    /// Move an item to `new_rank`; the items in between shift one place
    /// towards the vacated slot.
    ///
    /// # Errors
    /// Returns [`KernelError::ItemNotFound`] for an unknown id,
    /// [`KernelError::InvalidRank`] when `new_rank` is outside `1..=count`, and
    /// [`KernelError::Repository`] on persistence failure.
    pub fn re_rank(
        &mut self,
        category: &Category,
        item_id: &ItemId,
        new_rank: u32,
    ) -> Result<RankedItem, KernelError> {
        let mut items = self.items(category)?;
        let Some(index) = items.iter().position(|item| &item.id == item_id) else {
            return Err(KernelError::ItemNotFound {
                category: category.clone(),
                item_id: item_id.clone(),
            });
        };
        let max = count_as_rank(items.len());
        if new_rank == 0 || new_rank > max {
            return Err(KernelError::InvalidRank { rank: new_rank, max });
        }

        let old_rank = items[index].rank;
        let moved = items.remove(index);
        let target = usize::try_from(new_rank - 1).unwrap_or(items.len()).min(items.len());
        items.insert(target, moved);
        renumber(&mut items);
        self.repository.save_items(category, &items)?;

        let updated = find_item(&items, category, item_id)?;
        tracing::info!(
            category = %category,
            item_id = %item_id,
            old_rank,
            new_rank = updated.rank,
            "re-ranked item"
        );
        Ok(updated)
    }

    /// Replace an item's descriptive payload. Rank and score are untouched.
    ///
    /// # Errors
    /// Returns [`KernelError::ItemNotFound`] for an unknown id,
    /// [`KernelError::Validation`] for an invalid payload, and
    /// [`KernelError::Repository`] on persistence failure.
    pub fn update_details(
        &mut self,
        category: &Category,
        item_id: &ItemId,
        details: ItemDetails,
    ) -> Result<RankedItem, KernelError> {
        details.validate()?;
        let mut items = self.items(category)?;
        let Some(item) = items.iter_mut().find(|item| &item.id == item_id) else {
            return Err(KernelError::ItemNotFound {
                category: category.clone(),
                item_id: item_id.clone(),
            });
        };
        item.details = details;
        item.updated_at = Some(OffsetDateTime::now_utc());
        let updated = item.clone();

        self.repository.save_items(category, &items)?;
        tracing::debug!(category = %category, item_id = %item_id, "updated item details");
        Ok(updated)
    }

    /// Rebuild and persist a category, e.g. after an import merged records.
    ///
    /// # Errors
    /// Returns [`KernelError::Repository`] on persistence failure.
    pub fn normalize(&mut self, category: &Category) -> Result<Vec<RankedItem>, KernelError> {
        let items = self.items(category)?;
        self.repository.save_items(category, &items)?;
        Ok(items)
    }

    /// Remove every item in a category and return how many were dropped.
    ///
    /// # Errors
    /// Returns [`KernelError::Repository`] on persistence failure.
    pub fn clear(&mut self, category: &Category) -> Result<usize, KernelError> {
        let removed = self.repository.load_items(category)?.len();
        self.repository.save_items(category, &[])?;
        tracing::info!(category = %category, removed, "cleared category");
        Ok(removed)
    }

    /// # Errors
    /// Returns [`KernelError::Repository`] when loading fails.
    pub fn stats(&self, category: &Category) -> Result<CategoryStats, KernelError> {
        let items = self.items(category)?;
        let total_items = items.len();
        let average_score = if items.is_empty() {
            0.0
        } else {
            items.iter().map(|item| item.score).sum::<f64>() / f64::from(count_as_rank(total_items))
        };

        let mut recent_items = items.clone();
        recent_items.sort_by(|lhs, rhs| {
            rhs.created_at.cmp(&lhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
        });
        recent_items.truncate(RECENT_ITEMS_LIMIT);

        Ok(CategoryStats {
            category: category.clone(),
            total_items,
            average_score,
            top_item: items.into_iter().next(),
            recent_items,
        })
    }
}

fn find_item(
    items: &[RankedItem],
    category: &Category,
    item_id: &ItemId,
) -> Result<RankedItem, KernelError> {
    items.iter().find(|item| &item.id == item_id).cloned().ok_or_else(|| {
        KernelError::ItemNotFound { category: category.clone(), item_id: item_id.clone() }
    })
}
