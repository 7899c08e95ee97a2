// src/core/state/save.rs

//! Partition-table persistence.
//!
//! The state file carries a version string, a protocol version, the save
//! timestamp, then one packed record per partition. Saves go through a
//! temporary file and keep the previous generation as `.old`; loads fall
//! back to `.old` when the primary file is unreadable.

use super::tables::PartTable;
use crate::core::errors::LodestarError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

const PART_STATE_HEADER: &str = "lodestar-part-state";
/// Current record layout. Version 1 records lack billing weights.
const PART_STATE_VERSION: u16 = 2;
const PART_STATE_MIN_VERSION: u16 = 1;

/// The dynamic slice of a partition that survives restarts.
#[derive(Clone, Debug, PartialEq)]
pub struct PartRecord {
    pub name: String,
    pub node_expr: String,
    pub state_up: bool,
    pub is_default: bool,
    pub exclusive_user: bool,
    pub min_nodes: u32,
    pub max_nodes: Option<u32>,
    pub max_time_secs: Option<u64>,
    pub default_time_secs: Option<u64>,
    pub priority_tier: u16,
    pub priority_job_factor: u16,
    pub share: String,
    pub allow_accounts: Vec<String>,
    pub deny_accounts: Vec<String>,
    pub qos: Option<String>,
    pub billing_weights: Vec<(String, f64)>,
}

impl PartRecord {
    pub fn from_partition(p: &crate::core::types::partition::Partition) -> Self {
        Self {
            name: p.name.clone(),
            node_expr: p.node_expr.clone(),
            state_up: p.state_up,
            is_default: p.is_default,
            exclusive_user: p.exclusive_user,
            min_nodes: p.min_nodes,
            max_nodes: p.max_nodes,
            max_time_secs: p.max_time.map(|d| d.as_secs()),
            default_time_secs: p.default_time.map(|d| d.as_secs()),
            priority_tier: p.priority_tier,
            priority_job_factor: p.priority_job_factor,
            share: p.share.to_string(),
            allow_accounts: p.allow_accounts.clone(),
            deny_accounts: p.deny_accounts.clone(),
            qos: p.qos.clone(),
            billing_weights: p.billing_weights.clone(),
        }
    }
}

/// Packs the whole partition table into a state-file image.
pub fn pack_part_state(table: &PartTable) -> Bytes {
    let now = chrono::Utc::now().timestamp();
    let mut buf = BytesMut::new();
    put_str(&mut buf, PART_STATE_HEADER);
    buf.put_u16(PART_STATE_VERSION);
    buf.put_i64(now);

    let records: Vec<PartRecord> = table.iter().map(PartRecord::from_partition).collect();
    buf.put_u32(records.len() as u32);
    for rec in &records {
        pack_record(&mut buf, rec);
    }
    buf.freeze()
}

/// Unpacks a state-file image, up-converting older record layouts.
pub fn unpack_part_state(mut data: Bytes) -> Result<(i64, Vec<PartRecord>), LodestarError> {
    let header = get_str(&mut data)?;
    if header != PART_STATE_HEADER {
        return Err(LodestarError::StateFileCorrupt(format!(
            "unexpected header '{header}'"
        )));
    }
    if data.remaining() < 2 + 8 + 4 {
        return Err(LodestarError::StateFileCorrupt("truncated header".into()));
    }
    let version = data.get_u16();
    if !(PART_STATE_MIN_VERSION..=PART_STATE_VERSION).contains(&version) {
        return Err(LodestarError::StateFileCorrupt(format!(
            "unsupported partition state version {version}"
        )));
    }
    let timestamp = data.get_i64();
    let count = data.get_u32();
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        records.push(unpack_record(&mut data, version)?);
    }
    Ok((timestamp, records))
}

fn pack_record(buf: &mut BytesMut, rec: &PartRecord) {
    put_str(buf, &rec.name);
    put_str(buf, &rec.node_expr);
    let mut flags = 0u8;
    if rec.state_up {
        flags |= 1;
    }
    if rec.is_default {
        flags |= 2;
    }
    if rec.exclusive_user {
        flags |= 4;
    }
    buf.put_u8(flags);
    buf.put_u32(rec.min_nodes);
    put_opt_u64(buf, rec.max_nodes.map(u64::from));
    put_opt_u64(buf, rec.max_time_secs);
    put_opt_u64(buf, rec.default_time_secs);
    buf.put_u16(rec.priority_tier);
    buf.put_u16(rec.priority_job_factor);
    put_str(buf, &rec.share);
    put_str_list(buf, &rec.allow_accounts);
    put_str_list(buf, &rec.deny_accounts);
    match &rec.qos {
        Some(q) => {
            buf.put_u8(1);
            put_str(buf, q);
        }
        None => buf.put_u8(0),
    }
    buf.put_u32(rec.billing_weights.len() as u32);
    for (name, weight) in &rec.billing_weights {
        put_str(buf, name);
        buf.put_f64(*weight);
    }
}

fn unpack_record(data: &mut Bytes, version: u16) -> Result<PartRecord, LodestarError> {
    let name = get_str(data)?;
    let node_expr = get_str(data)?;
    if data.remaining() < 1 + 4 {
        return Err(LodestarError::StateFileCorrupt("truncated record".into()));
    }
    let flags = data.get_u8();
    let min_nodes = data.get_u32();
    let max_nodes = get_opt_u64(data)?.map(|v| v as u32);
    let max_time_secs = get_opt_u64(data)?;
    let default_time_secs = get_opt_u64(data)?;
    if data.remaining() < 4 {
        return Err(LodestarError::StateFileCorrupt("truncated record".into()));
    }
    let priority_tier = data.get_u16();
    let priority_job_factor = data.get_u16();
    let share = get_str(data)?;
    let allow_accounts = get_str_list(data)?;
    let deny_accounts = get_str_list(data)?;
    if data.remaining() < 1 {
        return Err(LodestarError::StateFileCorrupt("truncated record".into()));
    }
    let qos = if data.get_u8() == 1 {
        Some(get_str(data)?)
    } else {
        None
    };
    // Billing weights were added in version 2.
    let billing_weights = if version >= 2 {
        if data.remaining() < 4 {
            return Err(LodestarError::StateFileCorrupt("truncated record".into()));
        }
        let n = data.get_u32();
        let mut weights = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let name = get_str(data)?;
            if data.remaining() < 8 {
                return Err(LodestarError::StateFileCorrupt("truncated record".into()));
            }
            weights.push((name, data.get_f64()));
        }
        weights
    } else {
        Vec::new()
    };

    Ok(PartRecord {
        name,
        node_expr,
        state_up: flags & 1 != 0,
        is_default: flags & 2 != 0,
        exclusive_user: flags & 4 != 0,
        min_nodes,
        max_nodes,
        max_time_secs,
        default_time_secs,
        priority_tier,
        priority_job_factor,
        share,
        allow_accounts,
        deny_accounts,
        qos,
        billing_weights,
    })
}

/// Saves the packed image, rotating the previous generation to `.old`.
pub async fn save_part_state(image: Bytes, path: &Path) -> Result<(), LodestarError> {
    let tmp = with_suffix(path, ".new");
    let old = with_suffix(path, ".old");
    fs::write(&tmp, &image).await?;
    if fs::metadata(path).await.is_ok() {
        // Best effort; a missing .old only costs us the fallback copy.
        if let Err(e) = fs::rename(path, &old).await {
            warn!("Could not rotate {} to .old: {e}", path.display());
        }
    }
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Loads the state file, falling back to the `.old` generation.
pub async fn load_part_state(path: &Path) -> Result<(i64, Vec<PartRecord>), LodestarError> {
    match read_and_unpack(path).await {
        Ok(parsed) => Ok(parsed),
        Err(e) => {
            let old = with_suffix(path, ".old");
            warn!(
                "Could not load {}: {e}. Trying {}.",
                path.display(),
                old.display()
            );
            read_and_unpack(&old).await
        }
    }
}

async fn read_and_unpack(path: &Path) -> Result<(i64, Vec<PartRecord>), LodestarError> {
    let bytes = Bytes::from(fs::read(path).await?);
    unpack_part_state(bytes)
}

/// Applies restored records onto the configured partition table. Partitions
/// no longer in the configuration are reported and skipped.
pub fn apply_part_records(table: &mut PartTable, records: Vec<PartRecord>) {
    for rec in records {
        match table.find_mut(&rec.name) {
            Some(part) => {
                part.state_up = rec.state_up;
                part.min_nodes = rec.min_nodes;
                part.max_nodes = rec.max_nodes;
                part.max_time = rec.max_time_secs.map(std::time::Duration::from_secs);
                part.default_time = rec.default_time_secs.map(std::time::Duration::from_secs);
                part.priority_tier = rec.priority_tier;
                part.priority_job_factor = rec.priority_job_factor;
            }
            None => {
                info!(
                    "Partition '{}' in state file is no longer configured; ignoring.",
                    rec.name
                );
            }
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

// --- Pack primitives ---

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_str(data: &mut Bytes) -> Result<String, LodestarError> {
    if data.remaining() < 4 {
        return Err(LodestarError::StateFileCorrupt("truncated string".into()));
    }
    let len = data.get_u32() as usize;
    if data.remaining() < len {
        return Err(LodestarError::StateFileCorrupt("truncated string".into()));
    }
    let bytes = data.split_to(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| LodestarError::StateFileCorrupt("non-utf8 string".into()))
}

fn put_str_list(buf: &mut BytesMut, list: &[String]) {
    buf.put_u32(list.len() as u32);
    for s in list {
        put_str(buf, s);
    }
}

fn get_str_list(data: &mut Bytes) -> Result<Vec<String>, LodestarError> {
    if data.remaining() < 4 {
        return Err(LodestarError::StateFileCorrupt("truncated list".into()));
    }
    let n = data.get_u32();
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        out.push(get_str(data)?);
    }
    Ok(out)
}

fn put_opt_u64(buf: &mut BytesMut, v: Option<u64>) {
    match v {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64(v);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_u64(data: &mut Bytes) -> Result<Option<u64>, LodestarError> {
    if data.remaining() < 1 {
        return Err(LodestarError::StateFileCorrupt("truncated option".into()));
    }
    if data.get_u8() == 0 {
        return Ok(None);
    }
    if data.remaining() < 8 {
        return Err(LodestarError::StateFileCorrupt("truncated option".into()));
    }
    Ok(Some(data.get_u64()))
}
