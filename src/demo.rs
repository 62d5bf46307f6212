/// Demo tasks and flows
///
/// A small user-record pipeline registered by the binary so a fresh server
/// has something to run and schedule.

use crate::error::EngineResult;
use crate::history::RemarkLevel;
use crate::runtime::{add_remark, call_task, current_logger, set_progress};
use crate::workflow::{Params, Registry, RetryPolicy, TaskDefinition};
use anyhow::{bail, Context};
use chrono::{Datelike, Utc};
use serde_json::{json, Value};
use std::time::Duration;

/// Register the demo tasks and flows
pub fn register_demo_flows(registry: &Registry) -> EngineResult<()> {
    registry.register_task("validate", "Reject records with a negative age", validate)?;
    registry.register_task("transform", "Normalize name and derive birth year", transform)?;
    registry.register_task_definition(
        TaskDefinition::new("enrich", enrich)
            .with_display_name("Enrich record")
            .with_description("Add age group and processing time")
            .with_retry(RetryPolicy::exponential(2, Duration::from_millis(500))),
    )?;

    registry.register_flow(
        "f1",
        "Validate only",
        "Validates the input record and reports success",
        |params: Params| async move {
            call_task("validate", Value::Object(params)).await?;
            Ok(json!({ "ok": true }))
        },
    )?;

    registry.register_flow(
        "user_pipeline",
        "User pipeline",
        "Validate, transform and enrich a user record",
        |params: Params| async move {
            let record = call_task("validate", Value::Object(params)).await?;
            let record = call_task("transform", record).await?;
            let record = call_task("enrich", record).await?;
            if record["is_adult"] == json!(false) {
                add_remark(RemarkLevel::Info, "record belongs to a minor").await;
            }
            Ok(record)
        },
    )?;

    Ok(())
}

async fn validate(input: Value) -> anyhow::Result<Value> {
    let logger = current_logger()?;
    logger.info(format!("Validating {}", input));

    let age = input
        .get("age")
        .and_then(Value::as_i64)
        .context("record must contain an integer 'age'")?;
    if age < 0 {
        bail!("age must be a non-negative integer, got {}", age);
    }

    logger.info("Validation passed");
    Ok(input)
}

async fn transform(input: Value) -> anyhow::Result<Value> {
    let name = input.get("name").and_then(Value::as_str).unwrap_or("anonymous");
    let age = input.get("age").and_then(Value::as_i64).unwrap_or_default();
    set_progress(50, Some("normalizing")).await;

    Ok(json!({
        "name": name.to_uppercase(),
        "age": age,
        "birth_year": i64::from(Utc::now().year()) - age,
        "is_adult": age >= 18,
    }))
}

async fn enrich(mut input: Value) -> anyhow::Result<Value> {
    let age = input.get("age").and_then(Value::as_i64).unwrap_or_default();
    let group = match age {
        0..=12 => "child",
        13..=17 => "teen",
        18..=64 => "adult",
        _ => "senior",
    };
    if let Some(record) = input.as_object_mut() {
        record.insert("age_group".into(), json!(group));
        record.insert(
            "processed_at".into(),
            json!(Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()),
        );
    }
    current_logger()?.info(format!("Enriched record as {}", group));
    Ok(input)
}
