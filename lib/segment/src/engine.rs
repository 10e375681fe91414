use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::types::{Point, SearchRequest, SearchResult, ShardInfo};

const SHARD_FILE_NAME: &str = "sharddb.mp";

#[derive(Default, Serialize, Deserialize)]
struct OnDisk {
    points: Vec<Point>,
}

/// A loaded, opaque shard: an in-memory point store backed by a single msgpack file.
///
/// This is the concrete stand-in for the shard engine described in SPEC §4.2; the core
/// touches it only through this type's methods, exactly as it would a production vector index.
/// Mutating operations take `&self` — the engine manages its own internal consistency, the
/// same way a real index or embedded KV engine would; the shard manager's readers-writer lock
/// exists only to guard the *handle's* lifecycle (is it still open at all), not operation
/// ordering inside one open shard.
pub struct ShardEngine {
    dir: PathBuf,
    points: Mutex<Vec<Point>>,
}

impl ShardEngine {
    /// Opens (or creates) the shard rooted at `dir`. `_index_schema` is accepted and ignored —
    /// a production engine would validate typed properties against it; this one does not.
    pub fn open(dir: &Path, _index_schema: &serde_json::Value) -> EngineResult<Self> {
        fs::create_dir_all(dir)?;
        let file = dir.join(SHARD_FILE_NAME);
        let points = if file.exists() {
            let bytes = fs::read(&file)?;
            let on_disk: OnDisk = rmp_serde::from_slice(&bytes)?;
            on_disk.points
        } else {
            Vec::new()
        };
        Ok(Self { dir: dir.to_owned(), points: Mutex::new(points) })
    }

    pub fn info(&self) -> EngineResult<ShardInfo> {
        let size = fs::metadata(self.dir.join(SHARD_FILE_NAME))
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(ShardInfo { point_count: self.points.lock().len(), size })
    }

    pub fn insert_points(&self, points: Vec<Point>) -> EngineResult<()> {
        let mut store = self.points.lock();
        for point in points {
            match store.iter_mut().find(|p| p.id == point.id) {
                Some(existing) => *existing = point,
                None => store.push(point),
            }
        }
        self.flush(&store)
    }

    /// Returns the ids that were actually present and overwritten.
    pub fn update_points(&self, points: Vec<Point>) -> EngineResult<Vec<Uuid>> {
        let mut store = self.points.lock();
        let mut updated = Vec::new();
        for point in points {
            if let Some(existing) = store.iter_mut().find(|p| p.id == point.id) {
                *existing = point.clone();
                updated.push(point.id);
            }
        }
        self.flush(&store)?;
        Ok(updated)
    }

    /// Returns the ids that were actually present and removed.
    pub fn delete_points(&self, ids: &std::collections::HashSet<Uuid>) -> EngineResult<Vec<Uuid>> {
        let mut store = self.points.lock();
        let mut deleted = Vec::new();
        store.retain(|p| {
            if ids.contains(&p.id) {
                deleted.push(p.id);
                false
            } else {
                true
            }
        });
        self.flush(&store)?;
        Ok(deleted)
    }

    pub fn search_points(&self, request: &SearchRequest) -> EngineResult<Vec<SearchResult>> {
        if request.query.operator != "near" {
            return Ok(Vec::new());
        }
        let query_vec = &request.query.vector;
        let candidate_count = request.limit.max(request.query.search_size);

        let store = self.points.lock();
        let mut scored: Vec<(f32, &Point)> = store
            .iter()
            .filter_map(|point| {
                let vector = point.vector()?;
                Some((squared_euclidean(query_vec, &vector), point))
            })
            .collect();
        scored.sort_by(|a, b| OrderedFloat(a.0).cmp(&OrderedFloat(b.0)));

        let results = scored
            .into_iter()
            .skip(request.offset)
            .take(candidate_count)
            .map(|(distance, point)| SearchResult {
                point: point.clone(),
                distance: Some(distance),
                score: None,
                hybrid_score: -(distance as f64),
                decoded_data: point.decoded_data(),
            })
            .collect();
        Ok(results)
    }

    /// Copies the current shard file to a rotated backup, pruning all but the newest `keep_n`.
    /// `frequency_secs == 0` disables backups entirely (the caller is expected not to call this
    /// on a schedule in that case, but a stray call is harmless).
    pub fn backup(&self, frequency_secs: u64, keep_n: usize) -> EngineResult<()> {
        if frequency_secs == 0 {
            return Ok(());
        }
        let source = self.dir.join(SHARD_FILE_NAME);
        if !source.exists() {
            return Ok(());
        }
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let backup_path = self.dir.join(format!("{SHARD_FILE_NAME}.bak.{stamp}"));
        fs::copy(&source, &backup_path)?;
        prune_backups(&self.dir, keep_n)?;
        Ok(())
    }

    /// Finalizes the engine. Persistence is eager on every mutation, so this only exists to
    /// give the shard manager a total, explicit "done with this handle" point.
    pub fn close(&self) -> EngineResult<()> {
        self.flush(&self.points.lock())
    }

    fn flush(&self, store: &[Point]) -> EngineResult<()> {
        let on_disk = OnDisk { points: store.to_vec() };
        let bytes = rmp_serde::to_vec(&on_disk)?;
        fs::write(self.dir.join(SHARD_FILE_NAME), bytes)?;
        Ok(())
    }
}

fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn prune_backups(dir: &Path, keep_n: usize) -> EngineResult<()> {
    let mut backups: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            let stamp = name.strip_prefix(&format!("{SHARD_FILE_NAME}.bak."))?;
            stamp.parse::<u64>().ok().map(|s| (s, entry.path()))
        })
        .collect();
    backups.sort_by_key(|(stamp, _)| std::cmp::Reverse(*stamp));
    for (_, path) in backups.into_iter().skip(keep_n) {
        let _ = fs::remove_file(path);
    }
    Ok(())
}

impl std::fmt::Debug for ShardEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardEngine")
            .field("dir", &self.dir)
            .field("point_count", &self.points.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SearchQuery;

    fn point(id: Uuid, vector: Vec<f32>) -> Point {
        let data = rmp_serde::to_vec_named(&serde_json::json!({ "vector": vector })).unwrap();
        Point { id, data }
    }

    #[test]
    fn insert_then_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let schema = serde_json::json!({});
        let id = Uuid::new_v4();
        {
            let engine = ShardEngine::open(dir.path(), &schema).unwrap();
            engine.insert_points(vec![point(id, vec![1.0, 2.0])]).unwrap();
            assert_eq!(engine.info().unwrap().point_count, 1);
            engine.close().unwrap();
        }
        let engine = ShardEngine::open(dir.path(), &schema).unwrap();
        assert_eq!(engine.info().unwrap().point_count, 1);
    }

    #[test]
    fn search_orders_by_distance_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let schema = serde_json::json!({});
        let engine = ShardEngine::open(dir.path(), &schema).unwrap();
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        engine
            .insert_points(vec![point(far, vec![10.0, 10.0]), point(near, vec![1.0, 1.0])])
            .unwrap();

        let request = SearchRequest {
            query: SearchQuery { vector: vec![1.0, 1.0], operator: "near".into(), search_size: 10 },
            limit: 2,
            offset: 0,
            sort: vec![],
        };
        let results = engine.search_points(&request).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].point.id, near);
        assert_eq!(results[0].distance, Some(0.0));
        assert!(results[1].distance.unwrap() > 0.0);
    }

    #[test]
    fn update_reports_only_existing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let schema = serde_json::json!({});
        let engine = ShardEngine::open(dir.path(), &schema).unwrap();
        let existing = Uuid::new_v4();
        let missing = Uuid::new_v4();
        engine.insert_points(vec![point(existing, vec![1.0])]).unwrap();

        let updated = engine
            .update_points(vec![point(existing, vec![2.0]), point(missing, vec![3.0])])
            .unwrap();
        assert_eq!(updated, vec![existing]);
    }

    #[test]
    fn delete_reports_only_existing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let schema = serde_json::json!({});
        let engine = ShardEngine::open(dir.path(), &schema).unwrap();
        let existing = Uuid::new_v4();
        let missing = Uuid::new_v4();
        engine.insert_points(vec![point(existing, vec![1.0])]).unwrap();

        let mut ids = std::collections::HashSet::new();
        ids.insert(existing);
        ids.insert(missing);
        let deleted = engine.delete_points(&ids).unwrap();
        assert_eq!(deleted, vec![existing]);
        assert_eq!(engine.info().unwrap().point_count, 0);
    }

    #[test]
    fn backup_rotates_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let schema = serde_json::json!({});
        let engine = ShardEngine::open(dir.path(), &schema).unwrap();
        engine.insert_points(vec![point(Uuid::new_v4(), vec![1.0])]).unwrap();

        for stamp in 0..5u64 {
            let backup_path = dir.path().join(format!("{SHARD_FILE_NAME}.bak.{stamp}"));
            fs::copy(dir.path().join(SHARD_FILE_NAME), backup_path).unwrap();
        }
        prune_backups(dir.path(), 2).unwrap();
        let remaining = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_str().unwrap().contains(".bak."))
            .count();
        assert_eq!(remaining, 2);
    }
}
