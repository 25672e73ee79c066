//! Filesystem watches shared between connections.
//!
//! One inotify instance backs every watch. A path watched by several
//! connections owns a single kernel watch; it is removed only when the last
//! connection lets go.

use crate::config::types::{ConnectionId, FileMonitorConfig, Result, SupervisorError};
use crate::events::notifier::{AsyncEventType, EventNotifier};
use crate::kernel::inotify::{self, InotifyHandle, RawWatchEvent};
use crate::observability::audit::{AuditLog, SecurityEvent, SecurityEventType};
use crate::observability::metrics::SupervisorMetrics;
use crate::runtime::security::{path_validation, SecurityError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Event classes exposed to callers, as bit values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum FileEventType {
    Created = 0x01,
    Modified = 0x02,
    Deleted = 0x04,
    MovedFrom = 0x08,
    MovedTo = 0x10,
    Opened = 0x20,
    Closed = 0x40,
    Attrib = 0x80,
}

/// Every `FileEventType` bit
pub const FILE_EVENT_ALL: u32 = 0xFF;

/// Kernel mask used when the caller passes 0
pub const DEFAULT_WATCH_MASK: u32 = libc::IN_CREATE
    | libc::IN_MODIFY
    | libc::IN_DELETE
    | libc::IN_MOVED_FROM
    | libc::IN_MOVED_TO
    | libc::IN_CLOSE_WRITE;

impl FileEventType {
    pub fn bits(&self) -> u32 {
        *self as u32
    }

    /// Classify a kernel mask; the first match in priority order wins
    pub fn from_kernel_mask(mask: u32) -> Option<Self> {
        if mask & libc::IN_CREATE != 0 {
            Some(FileEventType::Created)
        } else if mask & libc::IN_MODIFY != 0 {
            Some(FileEventType::Modified)
        } else if mask & (libc::IN_DELETE | libc::IN_DELETE_SELF) != 0 {
            Some(FileEventType::Deleted)
        } else if mask & libc::IN_MOVED_FROM != 0 {
            Some(FileEventType::MovedFrom)
        } else if mask & libc::IN_MOVED_TO != 0 {
            Some(FileEventType::MovedTo)
        } else if mask & libc::IN_OPEN != 0 {
            Some(FileEventType::Opened)
        } else if mask & (libc::IN_CLOSE_WRITE | libc::IN_CLOSE_NOWRITE) != 0 {
            Some(FileEventType::Closed)
        } else if mask & libc::IN_ATTRIB != 0 {
            Some(FileEventType::Attrib)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventType::Created => "created",
            FileEventType::Modified => "modified",
            FileEventType::Deleted => "deleted",
            FileEventType::MovedFrom => "moved_from",
            FileEventType::MovedTo => "moved_to",
            FileEventType::Opened => "opened",
            FileEventType::Closed => "closed",
            FileEventType::Attrib => "attrib",
        }
    }
}

/// Convert `FileEventType` bits to an inotify mask; 0 selects the default
pub fn to_kernel_mask(bits: u32) -> u32 {
    if bits == 0 {
        return DEFAULT_WATCH_MASK;
    }
    let mut mask = 0;
    if bits & FileEventType::Created.bits() != 0 {
        mask |= libc::IN_CREATE;
    }
    if bits & FileEventType::Modified.bits() != 0 {
        mask |= libc::IN_MODIFY;
    }
    if bits & FileEventType::Deleted.bits() != 0 {
        mask |= libc::IN_DELETE | libc::IN_DELETE_SELF;
    }
    if bits & FileEventType::MovedFrom.bits() != 0 {
        mask |= libc::IN_MOVED_FROM;
    }
    if bits & FileEventType::MovedTo.bits() != 0 {
        mask |= libc::IN_MOVED_TO;
    }
    if bits & FileEventType::Opened.bits() != 0 {
        mask |= libc::IN_OPEN;
    }
    if bits & FileEventType::Closed.bits() != 0 {
        mask |= libc::IN_CLOSE_WRITE | libc::IN_CLOSE_NOWRITE;
    }
    if bits & FileEventType::Attrib.bits() != 0 {
        mask |= libc::IN_ATTRIB;
    }
    mask
}

/// Convert an inotify mask to `FileEventType` bits
pub fn from_kernel_mask(mask: u32) -> u32 {
    let mut bits = 0;
    if mask & libc::IN_CREATE != 0 {
        bits |= FileEventType::Created.bits();
    }
    if mask & libc::IN_MODIFY != 0 {
        bits |= FileEventType::Modified.bits();
    }
    if mask & (libc::IN_DELETE | libc::IN_DELETE_SELF) != 0 {
        bits |= FileEventType::Deleted.bits();
    }
    if mask & libc::IN_MOVED_FROM != 0 {
        bits |= FileEventType::MovedFrom.bits();
    }
    if mask & libc::IN_MOVED_TO != 0 {
        bits |= FileEventType::MovedTo.bits();
    }
    if mask & libc::IN_OPEN != 0 {
        bits |= FileEventType::Opened.bits();
    }
    if mask & (libc::IN_CLOSE_WRITE | libc::IN_CLOSE_NOWRITE) != 0 {
        bits |= FileEventType::Closed.bits();
    }
    if mask & libc::IN_ATTRIB != 0 {
        bits |= FileEventType::Attrib.bits();
    }
    bits & FILE_EVENT_ALL
}

/// Strip trailing slashes, keeping "/" itself
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEvent {
    /// Watched path plus entry name
    pub path: String,
    /// Entry name inside a watched directory; empty for the watched path itself
    pub name: String,
    pub event_type: FileEventType,
    /// Correlates MovedFrom/MovedTo pairs
    pub cookie: u32,
    pub is_directory: bool,
    pub timestamp: SystemTime,
}

/// One kernel watch and the connections sharing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchInfo {
    pub watch_descriptor: i32,
    pub path: String,
    pub mask: u32,
    pub connections: HashSet<ConnectionId>,
}

#[derive(Debug, Default)]
struct WatchTable {
    by_path: HashMap<String, WatchInfo>,
    by_wd: HashMap<i32, String>,
}

impl WatchTable {
    fn forget(&mut self, path: &str) -> Option<WatchInfo> {
        let info = self.by_path.remove(path)?;
        self.by_wd.remove(&info.watch_descriptor);
        Some(info)
    }
}

#[derive(Debug)]
pub struct FileMonitor {
    inotify: InotifyHandle,
    table: Mutex<WatchTable>,
    config: FileMonitorConfig,
    audit: Arc<AuditLog>,
}

impl FileMonitor {
    pub fn new(config: FileMonitorConfig, audit: Arc<AuditLog>) -> Result<Self> {
        Ok(Self {
            inotify: InotifyHandle::new()?,
            table: Mutex::new(WatchTable::default()),
            config,
            audit,
        })
    }

    /// Absolute, no traversal, not sensitive, under a safe prefix
    pub fn is_safe_path(&self, path: &str) -> bool {
        path_validation::is_safe_watch_path(path, &self.config.safe_prefixes)
    }

    /// Watch `path` for `conn`. `mask` is `FileEventType` bits; 0 selects
    /// the default set.
    pub fn add_watch(&self, conn: ConnectionId, path: &str, mask: u32) -> bool {
        match self.try_add_watch(conn, path, mask) {
            Ok(()) => true,
            Err(e) => {
                warn!("Connection {}: cannot watch {}: {}", conn, path, e);
                false
            }
        }
    }

    pub fn try_add_watch(&self, conn: ConnectionId, path: &str, mask: u32) -> Result<()> {
        if let Err(e) = path_validation::validate_watch_path(path, &self.config.safe_prefixes) {
            let event_type = match e {
                SecurityError::PathTraversal(_) => SecurityEventType::PathTraversalAttempt,
                _ => SecurityEventType::UnauthorizedPathAccess,
            };
            self.audit.record(
                SecurityEvent::new(event_type, e.to_string())
                    .with_connection(conn)
                    .with_path(path),
            );
            return Err(e.into());
        }

        let path = normalize_path(path);
        let kernel_mask = to_kernel_mask(mask & FILE_EVENT_ALL);
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(info) = table.by_path.get_mut(&path) {
            if info.mask & kernel_mask != kernel_mask {
                let merged = info.mask | kernel_mask;
                // Same inode: the kernel returns the same descriptor with the new mask
                self.inotify.add_watch(&path, merged)?;
                info.mask = merged;
            }
            info.connections.insert(conn);
            debug!(
                "Connection {} shares watch {} on {} ({} owners)",
                conn,
                info.watch_descriptor,
                path,
                info.connections.len()
            );
            return Ok(());
        }

        if table.by_path.len() >= self.config.max_watches {
            return Err(SupervisorError::Watch(format!(
                "watch limit reached ({})",
                self.config.max_watches
            )));
        }

        let wd = self.inotify.add_watch(&path, kernel_mask)?;
        let mut connections = HashSet::new();
        connections.insert(conn);
        table.by_wd.insert(wd, path.clone());
        table.by_path.insert(
            path.clone(),
            WatchInfo {
                watch_descriptor: wd,
                path: path.clone(),
                mask: kernel_mask,
                connections,
            },
        );
        info!("Watching {} (wd {}) for connection {}", path, wd, conn);
        Ok(())
    }

    /// Drop `conn` from the watch on `path`; the kernel watch goes with the last owner
    pub fn remove_watch(&self, conn: ConnectionId, path: &str) -> bool {
        let path = normalize_path(path);
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        let last_owner = match table.by_path.get_mut(&path) {
            Some(info) => {
                if !info.connections.remove(&conn) {
                    return false;
                }
                info.connections.is_empty()
            }
            None => return false,
        };
        if last_owner {
            if let Some(info) = table.forget(&path) {
                if let Err(e) = self.inotify.rm_watch(info.watch_descriptor) {
                    // Already gone if the path was deleted
                    debug!("{}", e);
                }
                info!("Removed watch on {}", path);
            }
        }
        true
    }

    /// Remove every watch held by `conn`; returns how many were released
    pub fn remove_all(&self, conn: ConnectionId) -> usize {
        let paths = self.watched_paths(conn);
        paths
            .iter()
            .filter(|path| self.remove_watch(conn, path))
            .count()
    }

    pub fn watched_paths(&self, conn: ConnectionId) -> Vec<String> {
        let table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        let mut paths: Vec<String> = table
            .by_path
            .values()
            .filter(|info| info.connections.contains(&conn))
            .map(|info| info.path.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn is_watching(&self, conn: ConnectionId, path: &str) -> bool {
        let path = normalize_path(path);
        self.table
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .by_path
            .get(&path)
            .map_or(false, |info| info.connections.contains(&conn))
    }

    /// Distinct kernel watches
    pub fn watch_count(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .by_path
            .len()
    }

    pub fn watch_info(&self, path: &str) -> Option<WatchInfo> {
        let path = normalize_path(path);
        self.table
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .by_path
            .get(&path)
            .cloned()
    }

    pub fn drain_events(&self) -> Vec<FileEvent> {
        self.drain_with_owners()
            .into_iter()
            .map(|(event, _)| event)
            .collect()
    }

    /// Read pending kernel events and attribute each to its watch's owners
    pub fn drain_with_owners(&self) -> Vec<(FileEvent, Vec<ConnectionId>)> {
        let mut buf = vec![0u8; inotify::EVENT_BUFFER_SIZE];
        let len = match self.inotify.read_into(&mut buf) {
            Ok(0) => return Vec::new(),
            Ok(n) => n,
            Err(e) => {
                warn!("{}", e);
                return Vec::new();
            }
        };

        let raw = inotify::parse_events(&buf, len, self.config.max_events_per_drain);
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = Vec::with_capacity(raw.len());
        for event in raw {
            if let Some(converted) = self.convert(&mut table, event) {
                out.push(converted);
            }
        }
        out
    }

    fn convert(
        &self,
        table: &mut WatchTable,
        event: RawWatchEvent,
    ) -> Option<(FileEvent, Vec<ConnectionId>)> {
        if event.mask & libc::IN_Q_OVERFLOW != 0 {
            warn!("inotify queue overflowed, events were lost");
            return None;
        }
        let watch_path = table.by_wd.get(&event.wd)?.clone();
        if event.mask & libc::IN_IGNORED != 0 {
            // Kernel dropped the watch (path deleted or unmounted)
            table.forget(&watch_path);
            debug!("Watch on {} invalidated by the kernel", watch_path);
            return None;
        }
        let event_type = FileEventType::from_kernel_mask(event.mask)?;
        let owners: Vec<ConnectionId> = table
            .by_path
            .get(&watch_path)
            .map(|info| info.connections.iter().copied().collect())
            .unwrap_or_default();
        let path = if event.name.is_empty() {
            watch_path
        } else if watch_path == "/" {
            format!("/{}", event.name)
        } else {
            format!("{}/{}", watch_path, event.name)
        };
        Some((
            FileEvent {
                path,
                name: event.name,
                event_type,
                cookie: event.cookie,
                is_directory: event.mask & libc::IN_ISDIR != 0,
                timestamp: SystemTime::now(),
            },
            owners,
        ))
    }

    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        self.inotify.raw_fd()
    }
}

/// Per-connection FileEvent queues fed from a `FileMonitor`
#[derive(Debug)]
pub struct FileMonitorManager {
    monitor: Arc<FileMonitor>,
    events: Arc<EventNotifier>,
    queues: Mutex<HashMap<ConnectionId, VecDeque<FileEvent>>>,
    max_connection_events: usize,
    metrics: Arc<SupervisorMetrics>,
}

impl FileMonitorManager {
    pub fn new(
        monitor: Arc<FileMonitor>,
        events: Arc<EventNotifier>,
        metrics: Arc<SupervisorMetrics>,
        config: &FileMonitorConfig,
    ) -> Self {
        Self {
            monitor,
            events,
            queues: Mutex::new(HashMap::new()),
            max_connection_events: config.max_connection_events.max(1),
            metrics,
        }
    }

    pub fn monitor(&self) -> &Arc<FileMonitor> {
        &self.monitor
    }

    /// Drain the kernel and fan events out to their owners. Returns the
    /// number of kernel events handled.
    pub fn process_file_events(&self) -> usize {
        let drained = self.monitor.drain_with_owners();
        let count = drained.len();
        if count == 0 {
            return 0;
        }
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        for (event, owners) in drained {
            self.metrics.file_events.inc();
            for conn in owners {
                let queue = queues.entry(conn).or_default();
                if queue.len() >= self.max_connection_events {
                    queue.pop_front();
                }
                queue.push_back(event.clone());

                if let Err(e) = self.events.signal_with_data(
                    conn,
                    AsyncEventType::FileChanged,
                    u64::from(event.event_type.bits()),
                    event.path.clone(),
                ) {
                    debug!("File event for connection {} not signalled: {}", conn, e);
                }
            }
        }
        count
    }

    pub fn get_events(&self, conn: ConnectionId) -> Vec<FileEvent> {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(&conn)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn has_events(&self, conn: ConnectionId) -> bool {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&conn)
            .map_or(false, |q| !q.is_empty())
    }

    /// Drop queued events and every watch held by `conn`
    pub fn cleanup(&self, conn: ConnectionId) {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&conn);
        let released = self.monitor.remove_all(conn);
        if released > 0 {
            debug!("Released {} watches of connection {}", released, conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> Option<FileMonitor> {
        match FileMonitor::new(FileMonitorConfig::default(), Arc::new(AuditLog::disabled())) {
            Ok(m) => Some(m),
            Err(e) => {
                eprintln!("inotify unavailable, skipping: {}", e);
                None
            }
        }
    }

    #[test]
    fn test_mask_conversion() {
        assert_eq!(to_kernel_mask(0), DEFAULT_WATCH_MASK);
        assert_eq!(
            to_kernel_mask(FileEventType::Created.bits()),
            libc::IN_CREATE
        );
        assert_eq!(
            from_kernel_mask(libc::IN_CREATE | libc::IN_MOVED_TO),
            FileEventType::Created.bits() | FileEventType::MovedTo.bits()
        );
        assert_eq!(from_kernel_mask(to_kernel_mask(FILE_EVENT_ALL)), FILE_EVENT_ALL);
    }

    #[test]
    fn test_classification_priority() {
        assert_eq!(
            FileEventType::from_kernel_mask(libc::IN_CREATE | libc::IN_MODIFY),
            Some(FileEventType::Created)
        );
        assert_eq!(
            FileEventType::from_kernel_mask(libc::IN_CLOSE_WRITE),
            Some(FileEventType::Closed)
        );
        assert_eq!(FileEventType::from_kernel_mask(libc::IN_IGNORED), None);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/tmp/x///"), "/tmp/x");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/tmp"), "/tmp");
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        let Some(mon) = monitor() else { return };
        assert!(!mon.is_safe_path("../../etc/passwd"));
        assert!(!mon.is_safe_path("/etc/passwd"));
        assert!(mon.is_safe_path("/tmp/x"));
        assert!(!mon.add_watch(1, "/etc", 0));
        assert!(!mon.add_watch(1, "/tmp/../etc", 0));
        assert_eq!(mon.watch_count(), 0);
        assert_eq!(mon.audit.count_of(SecurityEventType::PathTraversalAttempt), 1);
    }

    #[test]
    fn test_shared_watch_refcount() {
        let Some(mon) = monitor() else { return };
        let dir = tempfile::tempdir_in("/tmp").unwrap();
        let path = dir.path().to_str().unwrap().to_string();

        assert!(mon.add_watch(1, &path, 0));
        assert!(mon.add_watch(2, &format!("{}/", path), 0));
        assert_eq!(mon.watch_count(), 1);
        assert_eq!(mon.watch_info(&path).unwrap().connections.len(), 2);

        assert!(mon.remove_watch(1, &path));
        assert_eq!(mon.watch_count(), 1);
        assert!(mon.is_watching(2, &path));
        assert!(!mon.remove_watch(1, &path));

        assert!(mon.remove_watch(2, &path));
        assert_eq!(mon.watch_count(), 0);
    }

    #[test]
    fn test_drain_attributes_events() {
        let Some(mon) = monitor() else { return };
        let dir = tempfile::tempdir_in("/tmp").unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        assert!(mon.add_watch(4, &path, FileEventType::Created.bits()));

        std::fs::write(dir.path().join("new.txt"), b"x").unwrap();
        let events = mon.drain_with_owners();
        let (event, owners) = events
            .iter()
            .find(|(e, _)| e.name == "new.txt")
            .expect("create event");
        assert_eq!(event.event_type, FileEventType::Created);
        assert_eq!(event.path, format!("{}/new.txt", path));
        assert!(!event.is_directory);
        assert_eq!(owners, &vec![4]);
    }

    #[test]
    fn test_manager_fans_out_and_cleans_up() {
        let Some(mon) = monitor() else { return };
        let mon = Arc::new(mon);
        let bus = Arc::new(EventNotifier::new(&Default::default()).unwrap());
        let metrics = Arc::new(SupervisorMetrics::new());
        let config = FileMonitorConfig::default();
        let manager = FileMonitorManager::new(mon.clone(), bus.clone(), metrics.clone(), &config);
        bus.register_connection(1);

        let dir = tempfile::tempdir_in("/tmp").unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        assert!(mon.add_watch(1, &path, 0));
        assert!(mon.add_watch(2, &path, 0));

        std::fs::create_dir(dir.path().join("sub")).unwrap();
        assert!(manager.process_file_events() >= 1);
        assert!(manager.has_events(1));
        let events = manager.get_events(2);
        assert!(events.iter().any(|e| e.is_directory && e.name == "sub"));

        // Only the registered connection reaches the bus
        let bus_events = bus.drain_pending();
        assert!(bus_events
            .iter()
            .all(|e| e.connection_id == 1 && e.event_type == AsyncEventType::FileChanged));
        assert!(!bus_events.is_empty());

        manager.cleanup(1);
        assert!(!manager.has_events(1));
        assert_eq!(mon.watch_count(), 1);
        manager.cleanup(2);
        assert_eq!(mon.watch_count(), 0);
        assert!(metrics.file_events.get() >= 1);
    }
}
