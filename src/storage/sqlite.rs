//! SQLite flow store adapter

use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{error, warn};

use crate::models::{FlagId, FlowEntry, FlowId, PcapFile, Signature};

use super::Store;

/// Tags seeded at bootstrap so retrieval tooling can always enumerate them.
const BUILTIN_TAGS: &[&str] = &[
    "flag-in", "flag-out", "blocked", "suricata", "starred", "flagid", "tcp", "udp",
];

/// Thread-safe SQLite-backed flow store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open flow store: {}", path.as_ref().display()))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            -- Flow documents; payload-bearing fields are JSON columns
            CREATE TABLE IF NOT EXISTS flows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                src_ip TEXT NOT NULL,
                src_port INTEGER NOT NULL,
                dst_ip TEXT NOT NULL,
                dst_port INTEGER NOT NULL,
                time INTEGER NOT NULL,
                duration INTEGER NOT NULL,
                num_packets INTEGER NOT NULL,
                blocked INTEGER NOT NULL DEFAULT 0,
                filename TEXT NOT NULL,
                parent_id INTEGER,
                child_id INTEGER,
                size INTEGER NOT NULL,
                flow TEXT NOT NULL,
                tags TEXT NOT NULL,
                flags TEXT NOT NULL,
                flagids TEXT NOT NULL,
                fingerprints TEXT NOT NULL,
                suricata TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_flows_time ON flows(time);
            CREATE INDEX IF NOT EXISTS idx_flows_ports ON flows(src_port, dst_port);

            -- One row per fingerprint for cross-flow linkage lookups
            CREATE TABLE IF NOT EXISTS flow_fingerprints (
                flow_id INTEGER NOT NULL,
                fingerprint INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fingerprints ON flow_fingerprints(fingerprint);

            -- Enumerable tag set
            CREATE TABLE IF NOT EXISTS tags (
                name TEXT PRIMARY KEY
            ) WITHOUT ROWID;

            -- IDS signatures, deduplicated on content
            CREATE TABLE IF NOT EXISTS signatures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sig_id INTEGER NOT NULL,
                msg TEXT NOT NULL,
                action TEXT NOT NULL,
                tag TEXT NOT NULL DEFAULT '',
                UNIQUE(sig_id, msg, action, tag)
            );

            -- Capture files imported so far
            CREATE TABLE IF NOT EXISTS pcaps (
                file_name TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                finished INTEGER NOT NULL
            );

            -- Out-of-band flag ids
            CREATE TABLE IF NOT EXISTS flagids (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service TEXT NOT NULL,
                team INTEGER NOT NULL,
                round INTEGER NOT NULL,
                description TEXT NOT NULL,
                flagid TEXT NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    /// Find the most recent flow sharing any of the given fingerprints.
    fn find_linked_flow(&self, conn: &Connection, fingerprints: &[u32]) -> Result<Option<i64>> {
        let placeholders = vec!["?"; fingerprints.len()].join(",");
        let sql = format!(
            "SELECT f.id FROM flows f \
             JOIN flow_fingerprints fp ON fp.flow_id = f.id \
             WHERE fp.fingerprint IN ({}) \
             ORDER BY f.time DESC LIMIT 1",
            placeholders
        );

        let id = conn
            .query_row(
                &sql,
                params_from_iter(fingerprints.iter().map(|f| *f as i64)),
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        Ok(id)
    }

    /// Flows whose identity matches and whose start time is within the
    /// window. The bounds are exclusive: a flow exactly `window_ms` away
    /// does not match.
    fn matching_flow_ids(
        &self,
        conn: &Connection,
        flow: &FlowId,
        window_ms: i64,
    ) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare(
            "SELECT id FROM flows \
             WHERE src_ip = ? AND src_port = ? AND dst_ip = ? AND dst_port = ? \
             AND time > ? AND time < ?",
        )?;

        let ids = stmt
            .query_map(
                params![
                    flow.src_ip.to_string(),
                    flow.src_port,
                    flow.dst_ip.to_string(),
                    flow.dst_port,
                    flow.time - window_ms,
                    flow.time + window_ms,
                ],
                |row| row.get::<_, i64>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(ids)
    }

    /// Read-modify-write a flow's annotation columns.
    fn annotate_flow(
        &self,
        conn: &Connection,
        id: i64,
        tags: &[String],
        sig_handle: Option<i64>,
        set_blocked: bool,
    ) -> Result<()> {
        let (mut cur_tags, mut cur_suricata, cur_blocked): (Vec<String>, Vec<i64>, bool) = conn
            .query_row(
                "SELECT tags, suricata, blocked FROM flows WHERE id = ?",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                    ))
                },
            )
            .map(|(tags, suricata, blocked)| {
                (
                    serde_json::from_str(&tags).unwrap_or_default(),
                    serde_json::from_str(&suricata).unwrap_or_default(),
                    blocked,
                )
            })?;

        for tag in tags {
            if !cur_tags.iter().any(|t| t == tag) {
                cur_tags.push(tag.clone());
            }
        }
        if let Some(handle) = sig_handle {
            if !cur_suricata.contains(&handle) {
                cur_suricata.push(handle);
            }
        }

        conn.execute(
            "UPDATE flows SET tags = ?, suricata = ?, blocked = ? WHERE id = ?",
            params![
                serde_json::to_string(&cur_tags)?,
                serde_json::to_string(&cur_suricata)?,
                cur_blocked || set_blocked,
                id
            ],
        )?;

        Ok(())
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<FlowEntry> {
        let src_ip: String = row.get("src_ip")?;
        let dst_ip: String = row.get("dst_ip")?;
        let flow: String = row.get("flow")?;
        let tags: String = row.get("tags")?;
        let flags: String = row.get("flags")?;
        let flagids: String = row.get("flagids")?;
        let fingerprints: String = row.get("fingerprints")?;
        let suricata: String = row.get("suricata")?;

        Ok(FlowEntry {
            id: Some(row.get("id")?),
            src_ip: src_ip.parse::<IpAddr>().unwrap_or(IpAddr::from([0, 0, 0, 0])),
            dst_ip: dst_ip.parse::<IpAddr>().unwrap_or(IpAddr::from([0, 0, 0, 0])),
            src_port: row.get("src_port")?,
            dst_port: row.get("dst_port")?,
            time: row.get("time")?,
            duration: row.get("duration")?,
            num_packets: row.get("num_packets")?,
            blocked: row.get("blocked")?,
            filename: row.get("filename")?,
            parent_id: row.get("parent_id")?,
            child_id: row.get("child_id")?,
            size: row.get::<_, i64>("size")? as usize,
            flow: serde_json::from_str(&flow).unwrap_or_default(),
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            flags: serde_json::from_str(&flags).unwrap_or_default(),
            flagids: serde_json::from_str(&flagids).unwrap_or_default(),
            fingerprints: serde_json::from_str(&fingerprints).unwrap_or_default(),
            suricata: serde_json::from_str(&suricata).unwrap_or_default(),
        })
    }
}

/// Printable-ASCII rendering of raw payload bytes.
fn printable(raw: &[u8]) -> String {
    raw.iter()
        .filter(|b| (0x20..=0x7e).contains(*b))
        .map(|&b| b as char)
        .collect()
}

impl Store for SqliteStore {
    fn get_pcap(&self, name: &str) -> Result<Option<PcapFile>> {
        let conn = self.conn.lock().unwrap();

        let record = conn
            .query_row(
                "SELECT file_name, position, finished FROM pcaps WHERE file_name = ?",
                [name],
                |row| {
                    Ok(PcapFile {
                        file_name: row.get(0)?,
                        position: row.get::<_, i64>(1)? as u64,
                        finished: row.get(2)?,
                    })
                },
            )
            .optional()?;

        Ok(record)
    }

    fn insert_pcap(&self, record: &PcapFile) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pcaps (file_name, position, finished) VALUES (?, ?, ?) \
             ON CONFLICT(file_name) DO UPDATE SET position = excluded.position, finished = excluded.finished",
            params![record.file_name, record.position as i64, record.finished],
        )?;
        Ok(())
    }

    fn insert_flow(&self, mut entry: FlowEntry) -> Result<i64> {
        // Raw is authoritative; the printable rendering is derived here.
        for item in &mut entry.flow {
            item.data = printable(&item.raw);
        }

        let conn = self.conn.lock().unwrap();

        if !entry.fingerprints.is_empty() {
            match self.find_linked_flow(&conn, &entry.fingerprints) {
                Ok(linked) => entry.child_id = linked,
                Err(e) => warn!("fingerprint lookup failed: {e:#}"),
            }
        }

        conn.execute(
            "INSERT INTO flows (src_ip, src_port, dst_ip, dst_port, time, duration, \
             num_packets, blocked, filename, parent_id, child_id, size, flow, tags, \
             flags, flagids, fingerprints, suricata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.src_ip.to_string(),
                entry.src_port,
                entry.dst_ip.to_string(),
                entry.dst_port,
                entry.time,
                entry.duration,
                entry.num_packets,
                entry.blocked,
                entry.filename,
                entry.parent_id,
                entry.child_id,
                entry.size as i64,
                serde_json::to_string(&entry.flow)?,
                serde_json::to_string(&entry.tags)?,
                serde_json::to_string(&entry.flags)?,
                serde_json::to_string(&entry.flagids)?,
                serde_json::to_string(&entry.fingerprints)?,
                serde_json::to_string(&entry.suricata)?,
            ],
        )?;
        let id = conn.last_insert_rowid();

        for fp in &entry.fingerprints {
            conn.execute(
                "INSERT INTO flow_fingerprints (flow_id, fingerprint) VALUES (?, ?)",
                params![id, *fp as i64],
            )?;
        }

        if let Some(child) = entry.child_id {
            if let Err(e) = conn.execute(
                "UPDATE flows SET parent_id = ? WHERE id = ?",
                params![id, child],
            ) {
                error!("failed to back-patch parent flow {child}: {e}");
            }
        }

        Ok(id)
    }

    fn insert_tag(&self, tag: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("INSERT OR IGNORE INTO tags (name) VALUES (?)", [tag])?;
        Ok(())
    }

    fn add_signature(&self, sig: &Signature) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let tag = sig.tag.clone().unwrap_or_default();

        conn.execute(
            "INSERT OR IGNORE INTO signatures (sig_id, msg, action, tag) VALUES (?, ?, ?, ?)",
            params![sig.sig_id, sig.msg, sig.action, tag],
        )?;

        let id = conn.query_row(
            "SELECT id FROM signatures WHERE sig_id = ? AND msg = ? AND action = ? AND tag = ?",
            params![sig.sig_id, sig.msg, sig.action, tag],
            |row| row.get(0),
        )?;

        Ok(id)
    }

    fn add_signature_to_flow(&self, flow: &FlowId, sig: &Signature, window_ms: i64) -> Result<bool> {
        let handle = self.add_signature(sig)?;

        let mut tags = vec!["suricata".to_string()];
        self.insert_tag("suricata")?;
        if let Some(tag) = sig.tag.as_deref().filter(|t| !t.is_empty()) {
            self.insert_tag(tag)?;
            tags.push(tag.to_string());
        }

        let blocked = sig.action == "blocked";
        if blocked {
            tags.push("blocked".to_string());
        }

        let conn = self.conn.lock().unwrap();
        let ids = self.matching_flow_ids(&conn, flow, window_ms)?;
        for id in &ids {
            self.annotate_flow(&conn, *id, &tags, Some(handle), blocked)?;
        }

        Ok(!ids.is_empty())
    }

    fn add_tags_to_flow(&self, flow: &FlowId, tags: &[String], window_ms: i64) -> Result<bool> {
        for tag in tags {
            self.insert_tag(tag)?;
        }

        let conn = self.conn.lock().unwrap();
        let ids = self.matching_flow_ids(&conn, flow, window_ms)?;
        for id in &ids {
            self.annotate_flow(&conn, *id, tags, None, false)?;
        }

        Ok(!ids.is_empty())
    }

    fn insert_flagid(&self, flagid: &FlagId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO flagids (service, team, round, description, flagid) VALUES (?, ?, ?, ?, ?)",
            params![
                flagid.service,
                flagid.team,
                flagid.round,
                flagid.description,
                flagid.flagid
            ],
        )?;
        Ok(())
    }

    fn get_flagids(&self) -> Result<Vec<FlagId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT service, team, round, description, flagid FROM flagids")?;

        let flagids = stmt
            .query_map([], |row| {
                Ok(FlagId {
                    service: row.get(0)?,
                    team: row.get(1)?,
                    round: row.get(2)?,
                    description: row.get(3)?,
                    flagid: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(flagids)
    }

    fn get_flow(&self, id: i64) -> Result<Option<FlowEntry>> {
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row("SELECT * FROM flows WHERE id = ?", [id], Self::row_to_entry)
            .optional()?;
        Ok(entry)
    }

    fn list_flows(&self) -> Result<Vec<FlowEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM flows ORDER BY time DESC")?;
        let flows = stmt
            .query_map([], Self::row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(flows)
    }

    fn list_tags(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name FROM tags ORDER BY name")?;
        let tags = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    fn configure(&self) -> Result<()> {
        for tag in BUILTIN_TAGS {
            self.insert_tag(tag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, FlowItem};

    fn make_entry(time: i64, fingerprints: Vec<u32>) -> FlowEntry {
        FlowEntry {
            id: None,
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port: 53604,
            dst_port: 1337,
            time,
            duration: 10,
            num_packets: 2,
            blocked: false,
            filename: "test.pcap".to_string(),
            parent_id: None,
            child_id: None,
            fingerprints,
            suricata: vec![],
            flow: vec![FlowItem::new(
                Direction::Client,
                b"hello\x00\x01world".to_vec(),
                time,
            )],
            tags: vec!["tcp".to_string()],
            flags: vec![],
            flagids: vec![],
            size: 12,
        }
    }

    #[test]
    fn test_insert_flow_canonicalizes_data() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store.insert_flow(make_entry(1000, vec![])).unwrap();

        let entry = store.get_flow(id).unwrap().unwrap();
        assert_eq!(entry.flow[0].data, "helloworld");
        assert_eq!(entry.flow[0].raw, b"hello\x00\x01world");
        assert_eq!(entry.size, 12);
        assert!(entry.has_tag("tcp"));
    }

    #[test]
    fn test_fingerprint_linkage() {
        let store = SqliteStore::open_memory().unwrap();
        let a = store.insert_flow(make_entry(1000, vec![0xdead])).unwrap();
        let b = store.insert_flow(make_entry(2000, vec![0xdead, 0xbeef])).unwrap();

        let child = store.get_flow(b).unwrap().unwrap();
        assert_eq!(child.child_id, Some(a));

        let parent = store.get_flow(a).unwrap().unwrap();
        assert_eq!(parent.parent_id, Some(b));
    }

    #[test]
    fn test_fingerprint_links_newest_match() {
        let store = SqliteStore::open_memory().unwrap();
        store.insert_flow(make_entry(1000, vec![7])).unwrap();
        let newer = store.insert_flow(make_entry(5000, vec![7])).unwrap();
        let c = store.insert_flow(make_entry(9000, vec![7])).unwrap();

        let entry = store.get_flow(c).unwrap().unwrap();
        assert_eq!(entry.child_id, Some(newer));
    }

    #[test]
    fn test_signature_dedupe() {
        let store = SqliteStore::open_memory().unwrap();
        let sig = Signature {
            sig_id: 1338,
            msg: "Detected too many A's".to_string(),
            action: "allowed".to_string(),
            tag: None,
        };

        let h1 = store.add_signature(&sig).unwrap();
        let h2 = store.add_signature(&sig).unwrap();
        assert_eq!(h1, h2);

        let other = Signature {
            action: "blocked".to_string(),
            ..sig
        };
        let h3 = store.add_signature(&other).unwrap();
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_add_signature_to_flow_within_window() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store.insert_flow(make_entry(100_000, vec![])).unwrap();

        let sig = Signature {
            sig_id: 1338,
            msg: "x".to_string(),
            action: "allowed".to_string(),
            tag: None,
        };
        let flow_id = FlowId {
            src_ip: "10.0.0.1".parse().unwrap(),
            src_port: 53604,
            dst_ip: "10.0.0.2".parse().unwrap(),
            dst_port: 1337,
            time: 103_000,
        };

        assert!(store.add_signature_to_flow(&flow_id, &sig, 5000).unwrap());

        let entry = store.get_flow(id).unwrap().unwrap();
        assert!(entry.has_tag("suricata"));
        assert_eq!(entry.suricata.len(), 1);
        assert!(!entry.blocked);

        // Annotating twice must not duplicate anything.
        assert!(store.add_signature_to_flow(&flow_id, &sig, 5000).unwrap());
        let entry = store.get_flow(id).unwrap().unwrap();
        assert_eq!(entry.suricata.len(), 1);
        assert_eq!(entry.tags.iter().filter(|t| *t == "suricata").count(), 1);
    }

    #[test]
    fn test_add_signature_to_flow_window_bounds_are_exclusive() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store.insert_flow(make_entry(100_000, vec![])).unwrap();

        let sig = Signature {
            sig_id: 2,
            msg: "edge".to_string(),
            action: "allowed".to_string(),
            tag: None,
        };
        let at = |time: i64| FlowId {
            src_ip: "10.0.0.1".parse().unwrap(),
            src_port: 53604,
            dst_ip: "10.0.0.2".parse().unwrap(),
            dst_port: 1337,
            time,
        };

        // Exactly window_ms away on either side: no match.
        assert!(!store.add_signature_to_flow(&at(105_000), &sig, 5000).unwrap());
        assert!(!store.add_signature_to_flow(&at(95_000), &sig, 5000).unwrap());
        assert!(store.get_flow(id).unwrap().unwrap().suricata.is_empty());

        // One millisecond inside the window: match.
        assert!(store.add_signature_to_flow(&at(104_999), &sig, 5000).unwrap());
        assert_eq!(store.get_flow(id).unwrap().unwrap().suricata.len(), 1);
    }

    #[test]
    fn test_add_signature_to_flow_outside_window() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store.insert_flow(make_entry(100_000, vec![])).unwrap();

        let sig = Signature {
            sig_id: 1,
            msg: "y".to_string(),
            action: "allowed".to_string(),
            tag: None,
        };
        let flow_id = FlowId {
            src_ip: "10.0.0.1".parse().unwrap(),
            src_port: 53604,
            dst_ip: "10.0.0.2".parse().unwrap(),
            dst_port: 1337,
            time: 106_000,
        };

        assert!(!store.add_signature_to_flow(&flow_id, &sig, 5000).unwrap());
        let entry = store.get_flow(id).unwrap().unwrap();
        assert!(!entry.has_tag("suricata"));
        assert!(entry.suricata.is_empty());
    }

    #[test]
    fn test_blocked_action_sets_flag() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store.insert_flow(make_entry(50_000, vec![])).unwrap();

        let sig = Signature {
            sig_id: 9,
            msg: "drop rule".to_string(),
            action: "blocked".to_string(),
            tag: Some("exploit".to_string()),
        };
        let flow_id = FlowId {
            src_ip: "10.0.0.1".parse().unwrap(),
            src_port: 53604,
            dst_ip: "10.0.0.2".parse().unwrap(),
            dst_port: 1337,
            time: 50_000,
        };

        assert!(store.add_signature_to_flow(&flow_id, &sig, 5000).unwrap());
        let entry = store.get_flow(id).unwrap().unwrap();
        assert!(entry.blocked);
        assert!(entry.has_tag("blocked"));
        assert!(entry.has_tag("exploit"));
        assert!(store.list_tags().unwrap().contains(&"exploit".to_string()));
    }

    #[test]
    fn test_add_tags_to_flow() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store.insert_flow(make_entry(70_000, vec![])).unwrap();

        let flow_id = FlowId {
            src_ip: "10.0.0.1".parse().unwrap(),
            src_port: 53604,
            dst_ip: "10.0.0.2".parse().unwrap(),
            dst_port: 1337,
            time: 71_000,
        };
        let tags = vec!["fb1".to_string(), "fb2".to_string()];

        assert!(store.add_tags_to_flow(&flow_id, &tags, 5000).unwrap());
        let entry = store.get_flow(id).unwrap().unwrap();
        assert!(entry.has_tag("fb1"));
        assert!(entry.has_tag("fb2"));
    }

    #[test]
    fn test_pcap_upsert() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(store.get_pcap("a.pcap").unwrap().is_none());

        store
            .insert_pcap(&PcapFile {
                file_name: "a.pcap".to_string(),
                position: 6,
                finished: false,
            })
            .unwrap();

        let rec = store.get_pcap("a.pcap").unwrap().unwrap();
        assert_eq!(rec.position, 6);
        assert!(!rec.finished);

        store
            .insert_pcap(&PcapFile {
                file_name: "a.pcap".to_string(),
                position: 10,
                finished: true,
            })
            .unwrap();

        let rec = store.get_pcap("a.pcap").unwrap().unwrap();
        assert_eq!(rec.position, 10);
        assert!(rec.finished);
    }

    #[test]
    fn test_configure_seeds_tags() {
        let store = SqliteStore::open_memory().unwrap();
        store.configure().unwrap();
        let tags = store.list_tags().unwrap();
        for tag in super::BUILTIN_TAGS {
            assert!(tags.contains(&tag.to_string()), "missing builtin tag {tag}");
        }
    }

    #[test]
    fn test_flagids() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .insert_flagid(&FlagId {
                service: "notes".to_string(),
                team: 3,
                round: 12,
                description: "user id".to_string(),
                flagid: "a1b2c3".to_string(),
            })
            .unwrap();

        let flagids = store.get_flagids().unwrap();
        assert_eq!(flagids.len(), 1);
        assert_eq!(flagids[0].flagid, "a1b2c3");
    }
}
