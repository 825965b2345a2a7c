//! Stand-in for the workbook automation worker.
//!
//! Speaks the worker wire protocol on stdin/stdout and keeps its "live"
//! ledger in memory. Besides `append` it understands a few actions that make
//! supervision behaviour reproducible:
//!
//! - `ping`: answer immediately
//! - `hang`: never answer again
//! - `hang_once`: hang unless the file named by `marker` exists (creating it first)
//! - `slow`: answer after `delayMs`
//! - `exit`: exit with `code` without answering
//! - `fail`: answer `ok: false` with the given diagnostic fields
//!
//! `append` also takes `seed` (cells set before planning) and `editAfterPlan`
//! (cells set between planning and writing).
//!
//! Each start is appended to the file named by `INTAKE_MOCK_WORKER_SPAWN_LOG`.

use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate};
use intake_ledger::{plan_append, CommitHint, LedgerError, MemorySheet};
use serde_json::{json, Map, Value};

const SPAWN_LOG_ENV: &str = "INTAKE_MOCK_WORKER_SPAWN_LOG";

type Reply = Result<Map<String, Value>, Map<String, Value>>;

fn main() {
    record_spawn();

    // Noise the client has to tolerate.
    eprintln!("mock worker {} ready", process::id());
    emit_line("mock worker ready");

    let mut ledger = MemorySheet::new("mock");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let Ok(request) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let payload = request.get("payload").cloned().unwrap_or(Value::Null);

        let (ok, mut body) = match handle(&payload, &mut ledger) {
            Ok(body) => (true, body),
            Err(body) => (false, body),
        };
        body.insert("id".into(), id);
        body.insert("ok".into(), Value::Bool(ok));
        emit_line(&Value::Object(body).to_string());
    }
}

fn record_spawn() {
    let Ok(path) = std::env::var(SPAWN_LOG_ENV) else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", process::id());
    }
}

fn emit_line(line: &str) {
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

fn hang() -> ! {
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn handle(payload: &Value, ledger: &mut MemorySheet) -> Reply {
    if payload.get("__warmup").and_then(Value::as_bool) == Some(true) {
        return Ok(object(json!({
            "warmedUp": true,
            "excelPath": payload.get("excelPath").cloned().unwrap_or(Value::Null),
            "pid": process::id(),
        })));
    }

    match payload.get("action").and_then(Value::as_str).unwrap_or("") {
        "ping" => Ok(object(json!({ "pong": true, "pid": process::id() }))),
        "hang" => hang(),
        "hang_once" => {
            let marker = payload.get("marker").and_then(Value::as_str).unwrap_or("");
            if !marker.is_empty() && !Path::new(marker).exists() {
                let _ = std::fs::write(marker, b"hung");
                hang();
            }
            Ok(object(json!({ "recovered": true })))
        }
        "slow" => {
            let delay = payload.get("delayMs").and_then(Value::as_u64).unwrap_or(0);
            thread::sleep(Duration::from_millis(delay));
            Ok(object(json!({ "delayedMs": delay })))
        }
        "exit" => {
            let code = payload.get("code").and_then(Value::as_i64).unwrap_or(1);
            process::exit(code as i32);
        }
        "fail" => {
            let mut body = Map::new();
            for key in ["error", "where", "detail", "line", "code"] {
                if let Some(value) = payload.get(key) {
                    body.insert(key.into(), value.clone());
                }
            }
            Err(body)
        }
        "append" => append(payload, ledger),
        other => Err(object(json!({
            "error": format!("unknown action {other:?}"),
            "code": "UNKNOWN_ACTION",
        }))),
    }
}

fn today_from(payload: &Value) -> NaiveDate {
    payload
        .get("now")
        .and_then(Value::as_str)
        .and_then(|now| DateTime::parse_from_rfc3339(now).ok())
        .map(|now| now.date_naive())
        .unwrap_or_else(|| Local::now().date_naive())
}

fn append(payload: &Value, ledger: &mut MemorySheet) -> Reply {
    if let Some(seed) = payload.get("seed").and_then(Value::as_object) {
        seed_cells(ledger, seed).map_err(|err| failure(&err, "seed"))?;
    }

    let today = today_from(payload);
    let hint: Option<CommitHint> = payload
        .get("hint")
        .filter(|hint| !hint.is_null())
        .and_then(|hint| serde_json::from_value(hint.clone()).ok());
    let order = payload.get("order").cloned().unwrap_or(Value::Null);
    let samples: Vec<Value> = order
        .get("proben")
        .or_else(|| order.get("samples"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let plan = plan_append(&*ledger, hint.as_ref(), today).map_err(|err| failure(&err, "plan"))?;
    // Test hook: cells typed into the sheet between planning and writing.
    if let Some(edits) = payload.get("editAfterPlan").and_then(Value::as_object) {
        seed_cells(ledger, edits).map_err(|err| failure(&err, "editAfterPlan"))?;
    }
    plan.check_free(&*ledger, samples.len()).map_err(|err| failure(&err, "write"))?;
    let sample_nos = plan.sample_numbers(samples.len());

    ledger.set(plan.append_row, 1, plan.order_no.clone());
    let customer = order
        .get("kunde")
        .or_else(|| order.get("customer"))
        .and_then(Value::as_str)
        .unwrap_or("");
    ledger.set(plan.append_row, 2, customer);
    for (offset, (sample, lab_no)) in samples.iter().zip(&sample_nos).enumerate() {
        let row = plan.append_row + 1 + offset as u32;
        ledger.set(row, 1, lab_no.to_string());
        let label = match sample {
            Value::String(s) => s.clone(),
            Value::Object(obj) => obj
                .get("bezeichnung")
                .or_else(|| obj.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("Probe")
                .to_string(),
            other => other.to_string(),
        };
        ledger.set(row, 2, label);
    }

    Ok(object(json!({
        "appendRow": plan.append_row,
        "endRow": plan.end_row(samples.len()),
        "endRowRange": plan.end_row_range(samples.len()),
        "startLabNo": plan.start_lab_no,
        "sampleNos": sample_nos,
        "orderNo": plan.order_no,
        "todayPrefix": plan.today_prefix,
        "maxOrderSeqToday": plan.max_order_seq_today,
        "nextSeq": plan.next_seq,
        "computedOrderNo": plan.order_no,
        "usedHint": plan.from_hint,
        "saved": true,
    })))
}

fn seed_cells(ledger: &mut MemorySheet, cells: &Map<String, Value>) -> Result<(), LedgerError> {
    for (cell, value) in cells {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ledger.set_a1(cell, text)?;
    }
    Ok(())
}

fn failure(err: &LedgerError, stage: &str) -> Map<String, Value> {
    let code = match err {
        LedgerError::SequenceExhausted { .. } => "SEQUENCE_EXHAUSTED",
        LedgerError::AppendRowOccupied { .. } => "APPEND_ROW_OCCUPIED",
        _ => "APPEND_FAILED",
    };
    object(json!({
        "error": err.to_string(),
        "where": stage,
        "code": code,
    }))
}
