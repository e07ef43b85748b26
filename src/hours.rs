use std::path::Path;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Pickup,
    Return,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Pickup => "pickup",
            WindowKind::Return => "return",
        }
    }
}

/// Time-of-day range, inclusive at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningWindow {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl OpeningWindow {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Self {
        Self { open, close }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        self.open <= t && t <= self.close
    }
}

/// Answers when a location accepts pickups and returns. An empty list means closed.
#[async_trait]
pub trait OpeningWindowOracle: Send + Sync {
    async fn windows_for(&self, location_id: Ulid, date: NaiveDate, kind: WindowKind) -> Vec<OpeningWindow>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyWindow {
    pub weekday: Weekday,
    pub kind: WindowKind,
    pub open: NaiveTime,
    pub close: NaiveTime,
}

/// Date-specific override. No windows means closed that day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateException {
    pub date: NaiveDate,
    pub kind: WindowKind,
    #[serde(default)]
    pub windows: Vec<OpeningWindow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationHours {
    #[serde(default)]
    pub weekly: Vec<WeeklyWindow>,
    #[serde(default)]
    pub exceptions: Vec<DateException>,
}

#[derive(Debug, Deserialize)]
struct ScheduleFile {
    locations: Vec<LocationEntry>,
}

#[derive(Debug, Deserialize)]
struct LocationEntry {
    location_id: Ulid,
    #[serde(flatten)]
    hours: LocationHours,
}

/// Regular weekly hours per location, overridable per date.
#[derive(Default)]
pub struct WeeklySchedule {
    locations: DashMap<Ulid, LocationHours>,
}

impl WeeklySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{"locations": [{"location_id": "...", "weekly": [...], "exceptions": [...]}]}`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let file: ScheduleFile = serde_json::from_str(json)?;
        let schedule = Self::new();
        for entry in file.locations {
            schedule.locations.insert(entry.location_id, entry.hours);
        }
        Ok(schedule)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Replace the windows of one weekday for one kind.
    pub fn set_weekly(&self, location_id: Ulid, weekday: Weekday, kind: WindowKind, windows: &[OpeningWindow]) {
        let mut hours = self.locations.entry(location_id).or_default();
        hours.weekly.retain(|w| !(w.weekday == weekday && w.kind == kind));
        hours.weekly.extend(windows.iter().map(|w| WeeklyWindow {
            weekday,
            kind,
            open: w.open,
            close: w.close,
        }));
    }

    /// Same window for pickup and return on every day of the week.
    pub fn open_daily(&self, location_id: Ulid, open: NaiveTime, close: NaiveTime) {
        let window = [OpeningWindow::new(open, close)];
        for weekday in [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ] {
            self.set_weekly(location_id, weekday, WindowKind::Pickup, &window);
            self.set_weekly(location_id, weekday, WindowKind::Return, &window);
        }
    }

    pub fn set_exception(&self, location_id: Ulid, date: NaiveDate, kind: WindowKind, windows: &[OpeningWindow]) {
        let mut hours = self.locations.entry(location_id).or_default();
        hours.exceptions.retain(|e| !(e.date == date && e.kind == kind));
        hours.exceptions.push(DateException {
            date,
            kind,
            windows: windows.to_vec(),
        });
    }

    pub fn close_on(&self, location_id: Ulid, date: NaiveDate) {
        self.set_exception(location_id, date, WindowKind::Pickup, &[]);
        self.set_exception(location_id, date, WindowKind::Return, &[]);
    }

    fn lookup(&self, location_id: Ulid, date: NaiveDate, kind: WindowKind) -> Vec<OpeningWindow> {
        let Some(hours) = self.locations.get(&location_id) else {
            return Vec::new();
        };
        if let Some(exception) = hours.exceptions.iter().find(|e| e.date == date && e.kind == kind) {
            return exception.windows.clone();
        }
        let weekday = date.weekday();
        let mut windows: Vec<OpeningWindow> = hours
            .weekly
            .iter()
            .filter(|w| w.weekday == weekday && w.kind == kind)
            .map(|w| OpeningWindow::new(w.open, w.close))
            .collect();
        windows.sort_by_key(|w| w.open);
        windows
    }
}

#[async_trait]
impl OpeningWindowOracle for WeeklySchedule {
    async fn windows_for(&self, location_id: Ulid, date: NaiveDate, kind: WindowKind) -> Vec<OpeningWindow> {
        self.lookup(location_id, date, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    // 2024-01-10 is a Wednesday.
    fn wednesday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let w = OpeningWindow::new(t(9, 0), t(17, 0));
        assert!(w.contains(t(9, 0)));
        assert!(w.contains(t(17, 0)));
        assert!(!w.contains(t(17, 1)));
        assert!(!w.contains(t(8, 59)));
    }

    #[tokio::test]
    async fn unknown_location_is_closed() {
        let schedule = WeeklySchedule::new();
        let windows = schedule.windows_for(Ulid::new(), wednesday(), WindowKind::Pickup).await;
        assert!(windows.is_empty());
    }

    #[tokio::test]
    async fn weekly_hours_apply_by_weekday_and_kind() {
        let schedule = WeeklySchedule::new();
        let loc = Ulid::new();
        schedule.set_weekly(loc, Weekday::Wed, WindowKind::Pickup, &[OpeningWindow::new(t(9, 0), t(12, 0))]);
        schedule.set_weekly(loc, Weekday::Wed, WindowKind::Return, &[OpeningWindow::new(t(14, 0), t(18, 0))]);

        let pickup = schedule.windows_for(loc, wednesday(), WindowKind::Pickup).await;
        assert_eq!(pickup, vec![OpeningWindow::new(t(9, 0), t(12, 0))]);
        let ret = schedule.windows_for(loc, wednesday(), WindowKind::Return).await;
        assert_eq!(ret, vec![OpeningWindow::new(t(14, 0), t(18, 0))]);

        let thursday = wednesday().succ_opt().unwrap();
        assert!(schedule.windows_for(loc, thursday, WindowKind::Pickup).await.is_empty());
    }

    #[tokio::test]
    async fn exception_overrides_weekly() {
        let schedule = WeeklySchedule::new();
        let loc = Ulid::new();
        schedule.open_daily(loc, t(8, 0), t(20, 0));
        schedule.close_on(loc, wednesday());
        assert!(schedule.windows_for(loc, wednesday(), WindowKind::Pickup).await.is_empty());
        assert!(schedule.windows_for(loc, wednesday(), WindowKind::Return).await.is_empty());

        schedule.set_exception(loc, wednesday(), WindowKind::Return, &[OpeningWindow::new(t(10, 0), t(11, 0))]);
        let ret = schedule.windows_for(loc, wednesday(), WindowKind::Return).await;
        assert_eq!(ret, vec![OpeningWindow::new(t(10, 0), t(11, 0))]);
    }

    #[tokio::test]
    async fn set_weekly_replaces_previous_windows() {
        let schedule = WeeklySchedule::new();
        let loc = Ulid::new();
        schedule.set_weekly(loc, Weekday::Wed, WindowKind::Pickup, &[OpeningWindow::new(t(9, 0), t(10, 0))]);
        schedule.set_weekly(
            loc,
            Weekday::Wed,
            WindowKind::Pickup,
            &[OpeningWindow::new(t(15, 0), t(16, 0)), OpeningWindow::new(t(11, 0), t(12, 0))],
        );
        let windows = schedule.windows_for(loc, wednesday(), WindowKind::Pickup).await;
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].open, t(11, 0));
    }

    #[tokio::test]
    async fn schedule_from_json() {
        let loc = Ulid::new();
        let json = format!(
            r#"{{"locations": [{{
                "location_id": "{loc}",
                "weekly": [{{"weekday": "Mon", "kind": "pickup", "open": "09:00:00", "close": "17:00:00"}}],
                "exceptions": [{{"date": "2024-01-15", "kind": "pickup"}}]
            }}]}}"#
        );
        let schedule = WeeklySchedule::from_json(&json).unwrap();
        let monday = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        assert_eq!(schedule.windows_for(loc, monday, WindowKind::Pickup).await.len(), 1);
        let holiday = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert!(schedule.windows_for(loc, holiday, WindowKind::Pickup).await.is_empty());
    }

    #[test]
    fn schedule_from_invalid_json_fails() {
        assert!(WeeklySchedule::from_json("{\"locations\": 3}").is_err());
    }
}
