use chrono::NaiveDate;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::store::{self, keys, StateStore};
use crate::types::{ChatMessage, Classification, NewChatter, SuppressReason, TrackerEvent, Username};

/// Source of the current calendar date
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local wall-clock date
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// Decides which chatters are new this period and tracks who has been
/// greeted.
///
/// Sole owner and writer of the seen set, the acknowledged set, the bot list
/// and the last reset date. Acknowledged chatters, the bot list and the date
/// are written back to the state store whenever they change.
pub struct ChatterTracker {
    seen: HashSet<Username>,
    acknowledged: BTreeSet<Username>,
    bots: BTreeSet<Username>,
    last_reset: NaiveDate,
    clock: Arc<dyn Clock>,
    store: Arc<dyn StateStore>,
    events: broadcast::Sender<TrackerEvent>,
}

impl ChatterTracker {
    /// Restore state from `store`. `bot_override` (from the settings file)
    /// wins over the persisted bot list; `default_bots` is the last resort.
    pub fn load(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        bot_override: Option<Vec<String>>,
        default_bots: &[&str],
    ) -> Self {
        let today = clock.today();

        let last_reset = match store::load_date(store.as_ref(), keys::LAST_RESET_DATE) {
            Some(date) if date > today => {
                warn!("Stored reset date {} is in the future, using {}", date, today);
                today
            }
            Some(date) => date,
            None => today,
        };

        let acknowledged = store::load_strings(store.as_ref(), keys::ACKNOWLEDGED_CHATTERS)
            .unwrap_or_default()
            .iter()
            .map(|name| Username::new(name))
            .filter(|name| !name.is_empty())
            .collect();

        let persisted_bots = store::load_strings(store.as_ref(), keys::BOT_LIST);
        let bot_source_changed = bot_override.is_some();
        let bots: BTreeSet<Username> = match bot_override.or(persisted_bots) {
            Some(bots) => canonical_set(bots),
            None => canonical_set(default_bots.iter().copied()),
        };

        let (tx, _) = broadcast::channel(256);
        let tracker = Self {
            seen: HashSet::new(),
            acknowledged,
            bots,
            last_reset,
            clock,
            store,
            events: tx,
        };

        if bot_source_changed {
            tracker.persist_bot_list();
        }

        info!(
            "Chatter tracker ready: {} acknowledged, {} bots, last reset {}",
            tracker.acknowledged.len(),
            tracker.bots.len(),
            tracker.last_reset
        );
        tracker
    }

    /// Observer hook for collaborators outside the dock (an overlay, a
    /// panel). The dock itself works from the return values of
    /// [`classify`](Self::classify) and friends and does not subscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// Clear the period state if `today` differs from the last reset date.
    /// Returns whether a reset happened.
    pub fn check_period_reset(&mut self, today: NaiveDate) -> bool {
        if today == self.last_reset {
            return false;
        }

        info!("New period ({} -> {}), clearing chatters", self.last_reset, today);
        self.reset_to(today, false);
        true
    }

    /// Classify one chat message against the bot list and the seen set
    pub fn classify(&mut self, message: &ChatMessage) -> Classification {
        let today = self.clock.today();
        self.check_period_reset(today);

        let username = &message.username;
        if self.bots.contains(username) {
            debug!("Ignoring bot {}", username);
            return Classification::Suppressed(SuppressReason::Bot);
        }

        if !self.seen.insert(username.clone()) {
            return Classification::Suppressed(SuppressReason::AlreadySeen);
        }

        let chatter = NewChatter {
            username: username.clone(),
            display_name: message.display_name.clone(),
            already_acknowledged: self.acknowledged.contains(username),
        };
        info!("First message today from {} ({})", chatter.display_name, chatter.username);
        let _ = self.events.send(TrackerEvent::NewChatter(chatter.clone()));
        Classification::NewChatter(chatter)
    }

    /// Flip the acknowledged flag for `username`; returns the new state
    pub fn toggle_acknowledged(&mut self, username: &str) -> bool {
        let username = Username::new(username);

        let acknowledged = if self.acknowledged.remove(&username) {
            false
        } else {
            self.acknowledged.insert(username.clone());
            true
        };

        debug!("{} acknowledged: {}", username, acknowledged);
        self.persist_acknowledged();
        let _ = self.events.send(TrackerEvent::AcknowledgmentChanged { username, acknowledged });
        acknowledged
    }

    /// Operator-requested reset; ignores the date comparison
    pub fn manual_reset(&mut self) {
        let today = self.clock.today();
        info!("Manual reset requested");
        self.reset_to(today, true);
    }

    /// Replace the bot list. Applies to later messages only.
    pub fn update_bot_list<I, S>(&mut self, bots: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let bots = canonical_set(bots);
        if bots == self.bots {
            return;
        }

        info!("Bot list updated ({} entries)", bots.len());
        self.bots = bots;
        self.persist_bot_list();
    }

    pub fn is_bot(&self, username: &str) -> bool {
        self.bots.contains(&Username::new(username))
    }

    pub fn is_acknowledged(&self, username: &str) -> bool {
        self.acknowledged.contains(&Username::new(username))
    }

    pub fn has_seen(&self, username: &str) -> bool {
        self.seen.contains(&Username::new(username))
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn last_reset_date(&self) -> NaiveDate {
        self.last_reset
    }

    pub fn bot_list(&self) -> Vec<String> {
        self.bots.iter().map(|b| b.to_string()).collect()
    }

    pub fn acknowledged(&self) -> Vec<String> {
        self.acknowledged.iter().map(|a| a.to_string()).collect()
    }

    fn reset_to(&mut self, today: NaiveDate, manual: bool) {
        self.seen.clear();
        self.acknowledged.clear();
        self.last_reset = today;

        store::save_date(self.store.as_ref(), keys::LAST_RESET_DATE, today);
        self.persist_acknowledged();
        let _ = self.events.send(TrackerEvent::PeriodReset { date: today, manual });
    }

    fn persist_acknowledged(&self) {
        store::save_strings(self.store.as_ref(), keys::ACKNOWLEDGED_CHATTERS, self.acknowledged());
    }

    fn persist_bot_list(&self) {
        store::save_strings(self.store.as_ref(), keys::BOT_LIST, self.bot_list());
    }
}

fn canonical_set<I, S>(names: I) -> BTreeSet<Username>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| Username::new(name.as_ref()))
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::store::MemoryStateStore;
    use std::sync::Mutex;

    struct FixedClock(Mutex<NaiveDate>);

    impl FixedClock {
        fn new(date: NaiveDate) -> Arc<Self> {
            Arc::new(Self(Mutex::new(date)))
        }

        fn set(&self, date: NaiveDate) {
            *self.0.lock().unwrap() = date;
        }
    }

    impl Clock for FixedClock {
        fn today(&self) -> NaiveDate {
            *self.0.lock().unwrap()
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn chat(nick: &str) -> ChatMessage {
        ChatMessage {
            channel: "#chan".to_string(),
            username: Username::new(nick),
            display_name: nick.to_string(),
            content: "hi".to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    fn tracker_on(date: NaiveDate) -> (ChatterTracker, Arc<FixedClock>, Arc<MemoryStateStore>) {
        let clock = FixedClock::new(date);
        let store = Arc::new(MemoryStateStore::new());
        store::save_date(store.as_ref(), keys::LAST_RESET_DATE, date);
        let tracker = ChatterTracker::load(store.clone(), clock.clone(), None, &["nightbot"]);
        (tracker, clock, store)
    }

    #[test]
    fn test_first_seen_then_duplicate() {
        let (mut tracker, _clock, _store) = tracker_on(day(1));

        assert!(tracker.classify(&chat("alice")).is_new_chatter());
        assert_eq!(
            tracker.classify(&chat("alice")),
            Classification::Suppressed(SuppressReason::AlreadySeen)
        );
    }

    #[test]
    fn test_bots_are_suppressed_in_any_case() {
        let (mut tracker, _clock, _store) = tracker_on(day(1));

        assert_eq!(
            tracker.classify(&chat("NightBot")),
            Classification::Suppressed(SuppressReason::Bot)
        );
        assert!(!tracker.has_seen("nightbot"));
    }

    #[test]
    fn test_acknowledgment_is_case_insensitive() {
        let (mut tracker, _clock, store) = tracker_on(day(1));

        assert!(tracker.toggle_acknowledged("Alice"));
        assert_eq!(
            store::load_strings(store.as_ref(), keys::ACKNOWLEDGED_CHATTERS),
            Some(vec!["alice".to_string()])
        );

        match tracker.classify(&chat("alice")) {
            Classification::NewChatter(chatter) => assert!(chatter.already_acknowledged),
            other => panic!("expected a new chatter, got {:?}", other),
        }

        assert!(!tracker.toggle_acknowledged("ALICE"));
        assert!(!tracker.is_acknowledged("alice"));
    }

    #[test]
    fn test_subscribers_see_acknowledgment_changes() {
        let (mut tracker, _clock, _store) = tracker_on(day(1));
        let mut events = tracker.subscribe();

        tracker.toggle_acknowledged(" Bob ");

        assert_eq!(
            events.try_recv().unwrap(),
            TrackerEvent::AcknowledgmentChanged { username: Username::new("bob"), acknowledged: true }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_period_reset_is_idempotent() {
        let (mut tracker, _clock, _store) = tracker_on(day(1));
        tracker.classify(&chat("alice"));
        tracker.toggle_acknowledged("alice");

        assert!(tracker.check_period_reset(day(2)));
        assert!(!tracker.check_period_reset(day(2)));
        assert_eq!(tracker.last_reset_date(), day(2));
        assert_eq!(tracker.seen_count(), 0);
        assert!(!tracker.is_acknowledged("alice"));
    }

    #[test]
    fn test_date_change_makes_chatters_new_again() {
        let (mut tracker, clock, store) = tracker_on(day(1));
        let mut events = tracker.subscribe();

        assert!(tracker.classify(&chat("alice")).is_new_chatter());
        clock.set(day(2));
        assert!(tracker.classify(&chat("alice")).is_new_chatter());

        assert_eq!(store::load_date(store.as_ref(), keys::LAST_RESET_DATE), Some(day(2)));

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(match event {
                TrackerEvent::NewChatter(_) => "new",
                TrackerEvent::PeriodReset { manual: false, .. } => "auto-reset",
                TrackerEvent::PeriodReset { manual: true, .. } => "manual-reset",
                TrackerEvent::AcknowledgmentChanged { .. } => "ack",
            });
        }
        assert_eq!(kinds, vec!["new", "auto-reset", "new"]);
    }

    #[test]
    fn test_manual_reset_clears_on_same_day() {
        let (mut tracker, _clock, store) = tracker_on(day(3));
        tracker.classify(&chat("alice"));
        tracker.toggle_acknowledged("bob");

        tracker.manual_reset();

        assert!(!tracker.has_seen("alice"));
        assert!(!tracker.is_acknowledged("bob"));
        assert_eq!(tracker.last_reset_date(), day(3));
        assert_eq!(
            store::load_strings(store.as_ref(), keys::ACKNOWLEDGED_CHATTERS),
            Some(Vec::new())
        );
        assert!(tracker.classify(&chat("alice")).is_new_chatter());
    }

    #[test]
    fn test_update_bot_list_applies_to_later_messages() {
        let (mut tracker, _clock, store) = tracker_on(day(1));
        assert!(tracker.classify(&chat("moobot")).is_new_chatter());

        tracker.update_bot_list(["MooBot", " ", "nightbot"]);

        assert!(tracker.has_seen("moobot"));
        assert!(tracker.is_bot("MOOBOT"));
        assert_eq!(
            tracker.classify(&chat("moobot")),
            Classification::Suppressed(SuppressReason::Bot)
        );
        assert_eq!(
            store::load_strings(store.as_ref(), keys::BOT_LIST),
            Some(vec!["moobot".to_string(), "nightbot".to_string()])
        );
    }

    #[test]
    fn test_load_restores_persisted_state() {
        let store = Arc::new(MemoryStateStore::new());
        store::save_date(store.as_ref(), keys::LAST_RESET_DATE, day(4));
        store::save_strings(store.as_ref(), keys::ACKNOWLEDGED_CHATTERS, vec!["Carol"]);
        store::save_strings(store.as_ref(), keys::BOT_LIST, vec!["custombot"]);

        let tracker = ChatterTracker::load(store, FixedClock::new(day(4)), None, &["nightbot"]);

        assert!(tracker.is_acknowledged("carol"));
        assert!(tracker.is_bot("custombot"));
        assert!(!tracker.is_bot("nightbot"));
        assert_eq!(tracker.last_reset_date(), day(4));
    }

    #[test]
    fn test_settings_bot_list_wins_and_is_persisted() {
        let store = Arc::new(MemoryStateStore::new());
        store::save_strings(store.as_ref(), keys::BOT_LIST, vec!["custombot"]);

        let tracker = ChatterTracker::load(
            store.clone(),
            FixedClock::new(day(4)),
            Some(vec!["FromSettings".to_string()]),
            &["nightbot"],
        );

        assert_eq!(tracker.bot_list(), vec!["fromsettings".to_string()]);
        assert_eq!(
            store::load_strings(store.as_ref(), keys::BOT_LIST),
            Some(vec!["fromsettings".to_string()])
        );
    }

    #[test]
    fn test_missing_or_future_date_becomes_today() {
        let store = Arc::new(MemoryStateStore::new());
        let tracker = ChatterTracker::load(store.clone(), FixedClock::new(day(5)), None, &[]);
        assert_eq!(tracker.last_reset_date(), day(5));

        store::save_date(store.as_ref(), keys::LAST_RESET_DATE, day(20));
        let tracker = ChatterTracker::load(store, FixedClock::new(day(5)), None, &[]);
        assert_eq!(tracker.last_reset_date(), day(5));
    }
}
