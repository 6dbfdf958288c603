use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::alarm::lock_unpoisoned;
use crate::alarm::model::{Alarm, AlarmId, AlarmStatus, OwnerId};
use crate::alarm::time::CanonicalTime;

pub const STORE_FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("alarm {0} not found")]
    NotFound(AlarmId),

    #[error("alarm {id} is {from}; cannot move to {to}")]
    Conflict {
        id: AlarmId,
        from: AlarmStatus,
        to: AlarmStatus,
    },

    #[error("alarm store i/o failure at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("alarm store is corrupt: {0}")]
    Corrupt(String),

    #[error("alarm store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether repeating the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io { .. } | StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable mapping from alarm id to alarm record.
///
/// Implementations serialize their own mutations: `create` and `set_status`
/// are atomic with respect to every other call on the same store.
pub trait AlarmStore: Send + Sync {
    /// Persists a new `active` alarm and returns it with its assigned id.
    fn create(
        &self,
        owner_id: &OwnerId,
        time: CanonicalTime,
        created_at: DateTime<Local>,
    ) -> StoreResult<Alarm>;

    fn get(&self, id: AlarmId) -> StoreResult<Alarm>;

    /// Alarms of one owner, earliest time of day first.
    fn list_by_owner(&self, owner_id: &OwnerId, exclude_cancelled: bool)
    -> StoreResult<Vec<Alarm>>;

    fn find_active(&self, owner_id: &OwnerId, time: CanonicalTime) -> StoreResult<Option<Alarm>>;

    /// Compare-and-transition: fails with `Conflict` unless the current
    /// status may move to `status`.
    fn set_status(&self, id: AlarmId, status: AlarmStatus) -> StoreResult<Alarm>;

    fn delete(&self, id: AlarmId) -> StoreResult<()>;

    /// Active alarms of every owner.
    fn list_active(&self) -> StoreResult<Vec<Alarm>>;
}

#[derive(Debug, Clone, Default)]
struct AlarmTable {
    next_id: u64,
    alarms: BTreeMap<AlarmId, Alarm>,
}

impl AlarmTable {
    fn create(
        &mut self,
        owner_id: &OwnerId,
        time: CanonicalTime,
        created_at: DateTime<Local>,
    ) -> StoreResult<Alarm> {
        let id = AlarmId::new(self.next_id.max(1));
        self.next_id = id_after(id)?;
        let alarm = Alarm {
            id,
            owner_id: owner_id.clone(),
            time_of_day: time,
            status: AlarmStatus::Active,
            created_at,
        };
        self.alarms.insert(id, alarm.clone());
        Ok(alarm)
    }

    fn get(&self, id: AlarmId) -> StoreResult<Alarm> {
        self.alarms.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    fn list_by_owner(&self, owner_id: &OwnerId, exclude_cancelled: bool) -> Vec<Alarm> {
        let mut alarms = self
            .alarms
            .values()
            .filter(|alarm| &alarm.owner_id == owner_id)
            .filter(|alarm| !exclude_cancelled || alarm.status != AlarmStatus::Cancelled)
            .cloned()
            .collect::<Vec<_>>();
        sort_by_time_of_day(&mut alarms);
        alarms
    }

    fn find_active(&self, owner_id: &OwnerId, time: CanonicalTime) -> Option<Alarm> {
        self.alarms
            .values()
            .find(|alarm| {
                alarm.is_active() && &alarm.owner_id == owner_id && alarm.time_of_day == time
            })
            .cloned()
    }

    fn set_status(&mut self, id: AlarmId, status: AlarmStatus) -> StoreResult<Alarm> {
        let alarm = self.alarms.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !alarm.status.can_transition_to(status) {
            return Err(StoreError::Conflict {
                id,
                from: alarm.status,
                to: status,
            });
        }
        alarm.status = status;
        Ok(alarm.clone())
    }

    fn delete(&mut self, id: AlarmId) -> StoreResult<()> {
        self.alarms
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    fn list_active(&self) -> Vec<Alarm> {
        let mut alarms = self
            .alarms
            .values()
            .filter(|alarm| alarm.is_active())
            .cloned()
            .collect::<Vec<_>>();
        sort_by_time_of_day(&mut alarms);
        alarms
    }
}

fn sort_by_time_of_day(alarms: &mut [Alarm]) {
    alarms.sort_by(|a, b| a.time_of_day.cmp(&b.time_of_day).then_with(|| a.id.cmp(&b.id)));
}

/// Volatile store for tests and `--memory-store` runs.
#[derive(Debug, Default)]
pub struct MemoryAlarmStore {
    table: Mutex<AlarmTable>,
}

impl MemoryAlarmStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AlarmStore for MemoryAlarmStore {
    fn create(
        &self,
        owner_id: &OwnerId,
        time: CanonicalTime,
        created_at: DateTime<Local>,
    ) -> StoreResult<Alarm> {
        lock_unpoisoned(&self.table).create(owner_id, time, created_at)
    }

    fn get(&self, id: AlarmId) -> StoreResult<Alarm> {
        lock_unpoisoned(&self.table).get(id)
    }

    fn list_by_owner(
        &self,
        owner_id: &OwnerId,
        exclude_cancelled: bool,
    ) -> StoreResult<Vec<Alarm>> {
        Ok(lock_unpoisoned(&self.table).list_by_owner(owner_id, exclude_cancelled))
    }

    fn find_active(&self, owner_id: &OwnerId, time: CanonicalTime) -> StoreResult<Option<Alarm>> {
        Ok(lock_unpoisoned(&self.table).find_active(owner_id, time))
    }

    fn set_status(&self, id: AlarmId, status: AlarmStatus) -> StoreResult<Alarm> {
        lock_unpoisoned(&self.table).set_status(id, status)
    }

    fn delete(&self, id: AlarmId) -> StoreResult<()> {
        lock_unpoisoned(&self.table).delete(id)
    }

    fn list_active(&self) -> StoreResult<Vec<Alarm>> {
        Ok(lock_unpoisoned(&self.table).list_active())
    }
}

/// Store persisted as a single versioned JSON document.
///
/// Every mutation is staged on a copy of the table, written to disk, and only
/// then published; a failed write leaves both the file and the in-memory
/// view untouched.
#[derive(Debug)]
pub struct JsonFileAlarmStore {
    path: PathBuf,
    table: Mutex<AlarmTable>,
}

impl JsonFileAlarmStore {
    /// Opens `path`, treating a missing file as an empty store.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let table = match fs::read_to_string(&path) {
            Ok(content) => parse_store_text(&content)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => AlarmTable::default(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        debug!(
            path = %path.display(),
            alarms = table.alarms.len(),
            "opened alarm store"
        );
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored alarm in id order.
    pub fn snapshot(&self) -> Vec<Alarm> {
        lock_unpoisoned(&self.table).alarms.values().cloned().collect()
    }

    fn mutate<T>(&self, op: impl FnOnce(&mut AlarmTable) -> StoreResult<T>) -> StoreResult<T> {
        let mut table = lock_unpoisoned(&self.table);
        let mut staged = table.clone();
        let output = op(&mut staged)?;
        self.persist(&staged)?;
        *table = staged;
        Ok(output)
    }

    fn persist(&self, table: &AlarmTable) -> StoreResult<()> {
        let payload = StoreFileRef {
            version: STORE_FILE_VERSION,
            next_id: table.next_id,
            alarms: table.alarms.values().collect(),
        };
        let text = serde_json::to_string_pretty(&payload)
            .map_err(|err| StoreError::Unavailable(format!("could not encode alarms: {err}")))?;

        let staging = staging_path(&self.path);
        fs::write(&staging, format!("{text}\n")).map_err(|source| StoreError::Io {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

impl AlarmStore for JsonFileAlarmStore {
    fn create(
        &self,
        owner_id: &OwnerId,
        time: CanonicalTime,
        created_at: DateTime<Local>,
    ) -> StoreResult<Alarm> {
        self.mutate(|table| table.create(owner_id, time, created_at))
    }

    fn get(&self, id: AlarmId) -> StoreResult<Alarm> {
        lock_unpoisoned(&self.table).get(id)
    }

    fn list_by_owner(
        &self,
        owner_id: &OwnerId,
        exclude_cancelled: bool,
    ) -> StoreResult<Vec<Alarm>> {
        Ok(lock_unpoisoned(&self.table).list_by_owner(owner_id, exclude_cancelled))
    }

    fn find_active(&self, owner_id: &OwnerId, time: CanonicalTime) -> StoreResult<Option<Alarm>> {
        Ok(lock_unpoisoned(&self.table).find_active(owner_id, time))
    }

    fn set_status(&self, id: AlarmId, status: AlarmStatus) -> StoreResult<Alarm> {
        self.mutate(|table| table.set_status(id, status))
    }

    fn delete(&self, id: AlarmId) -> StoreResult<()> {
        self.mutate(|table| table.delete(id))
    }

    fn list_active(&self) -> StoreResult<Vec<Alarm>> {
        Ok(lock_unpoisoned(&self.table).list_active())
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .unwrap_or_else(|| OsStr::new("alarms.json"))
        .to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn parse_store_text(content: &str) -> StoreResult<AlarmTable> {
    let raw = serde_json::from_str::<StoreFile>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        StoreError::Corrupt(format!("invalid JSON at line {line}, column {column}: {err}"))
    })?;

    if raw.version != STORE_FILE_VERSION {
        return Err(StoreError::Corrupt(format!(
            "unsupported alarm store version {}; expected version {STORE_FILE_VERSION}",
            raw.version
        )));
    }

    let mut active_slots = HashSet::new();
    let mut table = AlarmTable {
        next_id: raw.next_id,
        alarms: BTreeMap::new(),
    };
    for alarm in raw.alarms {
        if alarm.is_active() && !active_slots.insert((alarm.owner_id.clone(), alarm.time_of_day)) {
            return Err(StoreError::Corrupt(format!(
                "owner '{}' has more than one active alarm at {}",
                alarm.owner_id, alarm.time_of_day
            )));
        }
        let id = alarm.id;
        if table.alarms.insert(id, alarm).is_some() {
            return Err(StoreError::Corrupt(format!("duplicate alarm id found: {id}")));
        }
        table.next_id = table.next_id.max(id_after(id)?);
    }
    Ok(table)
}

fn id_after(id: AlarmId) -> StoreResult<u64> {
    id.get()
        .checked_add(1)
        .ok_or_else(|| StoreError::Corrupt(format!("alarm id {id} leaves no room for new ids")))
}

#[derive(Debug, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    alarms: Vec<Alarm>,
}

#[derive(Debug, Serialize)]
struct StoreFileRef<'a> {
    version: u32,
    next_id: u64,
    alarms: Vec<&'a Alarm>,
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::alarm::time::normalize;

    fn owner(raw: &str) -> OwnerId {
        OwnerId::new(raw)
    }

    fn time(raw: &str) -> CanonicalTime {
        normalize(raw).expect("valid time")
    }

    fn check_store_contract(store: &dyn AlarmStore) {
        let u1 = owner("u1");
        let late = store.create(&u1, time("22:15"), Local::now()).expect("create");
        let early = store.create(&u1, time("6:45 am"), Local::now()).expect("create");
        let other = store.create(&owner("u2"), time("22:15"), Local::now()).expect("create");
        assert_ne!(late.id, early.id);
        assert_eq!(late.status, AlarmStatus::Active);

        assert_eq!(store.get(early.id).expect("get"), early);
        assert!(matches!(
            store.get(AlarmId::new(9_999)),
            Err(StoreError::NotFound(_))
        ));

        let found = store.find_active(&u1, time("22:15")).expect("find");
        assert_eq!(found.map(|alarm| alarm.id), Some(late.id));
        assert!(store.find_active(&u1, time("23:00")).expect("find").is_none());

        let listed = store.list_by_owner(&u1, true).expect("list");
        let ids = listed.iter().map(|alarm| alarm.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![early.id, late.id]);

        let cancelled = store.set_status(early.id, AlarmStatus::Cancelled).expect("cancel");
        assert_eq!(cancelled.status, AlarmStatus::Cancelled);
        let conflict = store
            .set_status(early.id, AlarmStatus::Triggered)
            .expect_err("terminal state");
        assert!(matches!(
            conflict,
            StoreError::Conflict {
                from: AlarmStatus::Cancelled,
                to: AlarmStatus::Triggered,
                ..
            }
        ));

        assert_eq!(store.list_by_owner(&u1, true).expect("list").len(), 1);
        assert_eq!(store.list_by_owner(&u1, false).expect("list").len(), 2);
        assert!(store.find_active(&u1, time("6:45 am")).expect("find").is_none());

        let active = store.list_active().expect("active");
        let active_ids = active.iter().map(|alarm| alarm.id).collect::<Vec<_>>();
        assert_eq!(active_ids, vec![late.id, other.id]);

        store.delete(other.id).expect("delete");
        assert!(matches!(store.delete(other.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn memory_store_honours_contract() {
        check_store_contract(&MemoryAlarmStore::new());
    }

    #[test]
    fn json_store_honours_contract() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileAlarmStore::open(dir.path().join("alarms.json")).expect("open");
        check_store_contract(&store);
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("alarms.json");
        let (kept, cancelled) = {
            let store = JsonFileAlarmStore::open(&path).expect("open");
            let kept = store.create(&owner("u1"), time("07:00"), Local::now()).expect("create");
            let cancelled = store
                .create(&owner("u1"), time("08:00"), Local::now())
                .expect("create");
            store.set_status(cancelled.id, AlarmStatus::Cancelled).expect("cancel");
            (kept, cancelled)
        };

        let reopened = JsonFileAlarmStore::open(&path).expect("reopen");
        assert_eq!(reopened.get(kept.id).expect("kept"), kept);
        assert_eq!(
            reopened.get(cancelled.id).expect("cancelled").status,
            AlarmStatus::Cancelled
        );
        let next = reopened.create(&owner("u1"), time("09:00"), Local::now()).expect("create");
        assert!(next.id > cancelled.id, "ids must not be reused after reopen");
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileAlarmStore::open(dir.path().join("absent.json")).expect("open");
        assert!(store.snapshot().is_empty());
        assert!(store.list_active().expect("active").is_empty());
    }

    #[test]
    fn malformed_json_is_reported_with_position() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("alarms.json");
        fs::write(&path, "{ not-valid-json ").expect("write");
        let err = JsonFileAlarmStore::open(&path).expect_err("corrupt file");
        assert!(err.to_string().contains("invalid JSON at line 1"));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = parse_store_text(r#"{ "version": 2, "alarms": [] }"#).expect_err("version");
        assert!(err.to_string().contains("unsupported alarm store version 2"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let json = r#"
{
  "version": 1,
  "alarms": [
    { "id": 1, "owner_id": "u1", "time_of_day": "07:00:00", "status": "triggered",
      "created_at": "2026-10-19T06:00:00+00:00" },
    { "id": 1, "owner_id": "u1", "time_of_day": "08:00:00", "status": "active",
      "created_at": "2026-10-19T06:00:00+00:00" }
  ]
}
"#;
        let err = parse_store_text(json).expect_err("duplicate id");
        assert!(err.to_string().contains("duplicate alarm id found: 1"));
    }

    #[test]
    fn duplicate_active_slots_are_rejected() {
        let json = r#"
{
  "version": 1,
  "alarms": [
    { "id": 1, "owner_id": "u1", "time_of_day": "07:00:00", "status": "active",
      "created_at": "2026-10-19T06:00:00+00:00" },
    { "id": 2, "owner_id": "u1", "time_of_day": "07:00:00", "status": "active",
      "created_at": "2026-10-19T06:00:00+00:00" }
  ]
}
"#;
        let err = parse_store_text(json).expect_err("duplicate slot");
        assert!(err.to_string().contains("more than one active alarm"));
    }

    #[test]
    fn next_id_is_derived_when_missing() {
        let json = r#"
{
  "version": 1,
  "alarms": [
    { "id": 41, "owner_id": "u1", "time_of_day": "07:00:00", "status": "active",
      "created_at": "2026-10-19T06:00:00+00:00" }
  ]
}
"#;
        let mut table = parse_store_text(json).expect("valid");
        let created = table
            .create(&owner("u1"), time("08:00"), Local::now())
            .expect("create");
        assert_eq!(created.id, AlarmId::new(42));
    }

    #[test]
    fn largest_possible_id_is_rejected() {
        let json = r#"
{
  "version": 1,
  "alarms": [
    { "id": 18446744073709551615, "owner_id": "u1", "time_of_day": "07:00:00",
      "status": "triggered", "created_at": "2026-10-19T06:00:00+00:00" }
  ]
}
"#;
        let err = parse_store_text(json).expect_err("id overflow");
        assert!(matches!(err, StoreError::Corrupt(_)));
        assert!(err.to_string().contains("leaves no room for new ids"));
    }

    #[test]
    fn exhausted_ids_fail_the_create() {
        let json = r#"{ "version": 1, "next_id": 18446744073709551615, "alarms": [] }"#;
        let mut table = parse_store_text(json).expect("valid");
        let err = table
            .create(&owner("u1"), time("08:00"), Local::now())
            .expect_err("no ids left");
        assert!(matches!(err, StoreError::Corrupt(_)));
        assert!(table.alarms.is_empty());
    }

    #[test]
    fn failed_write_leaves_store_unchanged() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("missing-dir").join("alarms.json");
        let store = JsonFileAlarmStore::open(path).expect("open");
        let err = store
            .create(&owner("u1"), time("07:00"), Local::now())
            .expect_err("parent directory does not exist");
        assert!(err.is_transient());
        assert!(store.snapshot().is_empty());
        assert!(store.find_active(&owner("u1"), time("07:00")).expect("find").is_none());
    }
}
