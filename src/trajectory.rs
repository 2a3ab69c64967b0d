// Trajectory persistence.
//
// One record per scored step. Two stores share the record schema:
// `JsonTrajectoryFile` rewrites a single JSON document on every append (the
// format read back by the action evaluator) and `SqliteTrajectoryLog` appends
// rows to a database.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub batch_index: usize,
    pub prev_obs: String,
    pub action: String,
    pub obs: String,
    pub observation_loss: f32,
    pub value_loss: f32,
    pub negentropy: f32,
    /// Written as 0.0 when the step was not perturbed.
    #[serde(default, serialize_with = "zero_when_absent")]
    pub perturbed_loss: Option<f32>,
}

fn zero_when_absent<S: serde::Serializer>(v: &Option<f32>, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f32(v.unwrap_or(0.0))
}

/// Run description stored alongside the steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryMetadata {
    pub model: String,
    pub lr: f64,
    pub batch_size: usize,
    pub num_batches: usize,
    pub optimizer: String,
    pub dataset: serde_json::Value,
    pub perturbation: serde_json::Value,
    pub trainer: String,
    pub inference: serde_json::Value,
    pub prediction: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryDocument {
    #[serde(flatten)]
    pub metadata: TrajectoryMetadata,
    pub trajectory: Vec<TrajectoryStep>,
}

pub trait TrajectoryStore {
    /// Append one step. Earlier steps are never modified.
    fn append(&mut self, step: TrajectoryStep) -> Result<()>;
    fn len(&self) -> Result<usize>;
    fn location(&self) -> &Path;
}

// ---------------------------------------------------------------------------
// JSON document
// ---------------------------------------------------------------------------

pub struct JsonTrajectoryFile {
    path: PathBuf,
    doc: TrajectoryDocument,
}

impl JsonTrajectoryFile {
    /// Create `{dir}/{base}_{unix_millis}.json` with an empty trajectory. A
    /// name already taken gets a `_{n}` suffix.
    pub fn create(dir: &Path, base: &str, metadata: TrajectoryMetadata) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let stamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let mut n = 0;
        let path = loop {
            let name = match n {
                0 => format!("{base}_{stamp}.json"),
                _ => format!("{base}_{stamp}_{n}.json"),
            };
            let path = dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => break path,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(e).with_context(|| format!("creating {}", path.display())),
            }
        };
        let file = Self { path, doc: TrajectoryDocument { metadata, trajectory: Vec::new() } };
        file.write()?;
        Ok(file)
    }

    pub fn document(&self) -> &TrajectoryDocument {
        &self.doc
    }

    fn write(&self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.doc)?)
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

impl TrajectoryStore for JsonTrajectoryFile {
    fn append(&mut self, step: TrajectoryStep) -> Result<()> {
        self.doc.trajectory.push(step);
        self.write()
    }

    fn len(&self) -> Result<usize> {
        Ok(self.doc.trajectory.len())
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

pub fn read_trajectory(path: &Path) -> Result<TrajectoryDocument> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

// ---------------------------------------------------------------------------
// SQLite log
// ---------------------------------------------------------------------------

pub struct SqliteTrajectoryLog {
    conn: Connection,
    path: PathBuf,
    run_id: i64,
}

impl SqliteTrajectoryLog {
    /// Open (or create) a log. Use ":memory:" in tests.
    pub fn open(path: &Path, metadata: &TrajectoryMetadata) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started TEXT NOT NULL DEFAULT (datetime('now')),
                metadata TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                batch_index INTEGER NOT NULL,
                prev_obs TEXT NOT NULL,
                action TEXT NOT NULL,
                obs TEXT NOT NULL,
                observation_loss REAL NOT NULL,
                value_loss REAL NOT NULL,
                negentropy REAL NOT NULL,
                perturbed_loss REAL
            );
            CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id, id);",
        )?;
        conn.execute(
            "INSERT INTO runs (metadata) VALUES (?1)",
            params![serde_json::to_string(metadata)?],
        )?;
        let run_id = conn.last_insert_rowid();
        Ok(Self { conn, path: path.to_path_buf(), run_id })
    }

    /// Steps of this handle's run, in append order.
    pub fn steps(&self) -> Result<Vec<TrajectoryStep>> {
        query_steps(&self.conn, self.run_id)
    }

    /// Steps of the most recent run in an existing log, without starting a new run.
    pub fn read_latest(path: &Path) -> Result<Vec<TrajectoryStep>> {
        let conn = Connection::open_with_flags(path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("opening {}", path.display()))?;
        query_steps(&conn, latest_run(&conn)?)
    }
}

fn latest_run(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT MAX(id) FROM runs", [], |r| r.get(0))?)
}

fn query_steps(conn: &Connection, run_id: i64) -> Result<Vec<TrajectoryStep>> {
    let mut stmt = conn.prepare(
        "SELECT batch_index, prev_obs, action, obs, observation_loss, value_loss,
                negentropy, perturbed_loss
         FROM steps WHERE run_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![run_id], |row| {
        let batch_index: i64 = row.get(0)?;
        Ok(TrajectoryStep {
            batch_index: batch_index as usize,
            prev_obs: row.get(1)?,
            action: row.get(2)?,
            obs: row.get(3)?,
            observation_loss: row.get::<_, f64>(4)? as f32,
            value_loss: row.get::<_, f64>(5)? as f32,
            negentropy: row.get::<_, f64>(6)? as f32,
            perturbed_loss: row.get::<_, Option<f64>>(7)?.map(|v| v as f32),
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

impl TrajectoryStore for SqliteTrajectoryLog {
    fn append(&mut self, step: TrajectoryStep) -> Result<()> {
        self.conn.execute(
            "INSERT INTO steps (run_id, batch_index, prev_obs, action, obs, observation_loss,
                                value_loss, negentropy, perturbed_loss)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                self.run_id,
                step.batch_index as i64,
                step.prev_obs,
                step.action,
                step.obs,
                step.observation_loss as f64,
                step.value_loss as f64,
                step.negentropy as f64,
                step.perturbed_loss.map(|v| v as f64),
            ],
        )?;
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM steps WHERE run_id = ?1",
            params![self.run_id],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> TrajectoryMetadata {
        TrajectoryMetadata {
            model: "tiny".into(),
            lr: 1e-4,
            batch_size: 2,
            num_batches: 3,
            optimizer: "sgd".into(),
            dataset: serde_json::json!({"task": {"kind": "arithmetic"}}),
            perturbation: serde_json::Value::Null,
            trainer: "action_observation".into(),
            inference: serde_json::json!({"temperature": 1.0}),
            prediction: "observation".into(),
        }
    }

    fn step(i: usize) -> TrajectoryStep {
        TrajectoryStep {
            batch_index: i,
            prev_obs: format!("prev {i}"),
            action: format!("act {i}"),
            obs: format!("obs {i}"),
            observation_loss: 1.5 + i as f32,
            value_loss: 0.25,
            negentropy: -2.0,
            perturbed_loss: if i % 2 == 0 { Some(3.0) } else { None },
        }
    }

    #[test]
    fn test_json_file_appends_and_reads_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut file = JsonTrajectoryFile::create(dir.path(), "tiny_traj", metadata())?;
        let name = file.location().file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        assert!(name.starts_with("tiny_traj_") && name.ends_with(".json"));

        file.append(step(1))?;
        let first = read_trajectory(file.location())?;
        file.append(step(2))?;
        let second = read_trajectory(file.location())?;

        assert_eq!(second.trajectory.len(), 2);
        assert_eq!(second.trajectory[..1], first.trajectory[..]);
        assert_eq!(second.metadata, metadata());

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(file.location())?)?;
        for key in ["model", "lr", "batch_size", "optimizer", "trajectory"] {
            assert!(raw.get(key).is_some(), "missing {key}");
        }
        assert_eq!(raw["trajectory"][0]["prev_obs"], "prev 1");
        Ok(())
    }

    #[test]
    fn test_json_files_do_not_collide() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut a = JsonTrajectoryFile::create(dir.path(), "tiny_traj", metadata())?;
        let mut b = JsonTrajectoryFile::create(dir.path(), "tiny_traj", metadata())?;
        assert_ne!(a.location(), b.location());
        a.append(step(1))?;
        b.append(step(2))?;
        assert_eq!(read_trajectory(a.location())?.trajectory[0].batch_index, 1);
        assert_eq!(read_trajectory(b.location())?.trajectory[0].batch_index, 2);
        Ok(())
    }

    #[test]
    fn test_unperturbed_step_writes_zero() -> Result<()> {
        let raw = serde_json::to_value(step(1))?;
        assert_eq!(raw["perturbed_loss"], serde_json::json!(0.0));
        let raw = serde_json::to_value(step(2))?;
        assert_eq!(raw["perturbed_loss"], serde_json::json!(3.0));
        Ok(())
    }

    #[test]
    fn test_sqlite_log_is_append_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("traj.sqlite");
        let mut log = SqliteTrajectoryLog::open(&path, &metadata())?;
        for i in 0..3 {
            log.append(step(i))?;
        }
        assert_eq!(log.len()?, 3);
        let steps = log.steps()?;
        assert_eq!(steps, vec![step(0), step(1), step(2)]);

        // A second run in the same file starts its own sequence.
        let mut again = SqliteTrajectoryLog::open(&path, &metadata())?;
        assert_eq!(again.len()?, 0);
        again.append(step(9))?;
        assert_eq!(again.steps()?, vec![step(9)]);

        // The older handle keeps writing to its own run.
        log.append(step(3))?;
        assert_eq!(log.len()?, 4);
        assert_eq!(again.len()?, 1);
        assert_eq!(log.steps()?.last(), Some(&step(3)));
        assert_eq!(SqliteTrajectoryLog::read_latest(&path)?, vec![step(9)]);
        Ok(())
    }
}
