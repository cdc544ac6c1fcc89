use chrono::NaiveDate;
use clap::{Args, Subcommand};
use serde_json::json;
use spotter_core::error::{ErrorEnvelope, codes};
use spotter_core::recovery::{PlanCompleteness, recover_model_response};
use spotter_core::weekdays::WeekdayPreference;
use spotter_runtime::{
    OperationDeduplicator, OperationDescriptor, OperationError, RefreshOutcome, ResilienceConfig,
    ResilienceError,
};

use crate::util::{
    EXIT_CLIENT_ERROR, print_error, print_json, read_input, resilience_envelope,
    resilience_exit_code, usage_error,
};

const FETCH_OPERATION: &str = "fetch_plan_response";
const ERROR_BODY_PREVIEW_CHARS: usize = 200;

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Recover a workout plan from a raw model response and map it onto the week
    Recover(RecoverArgs),
    /// Show how a training-day preference is normalized
    Days {
        /// Preferred weekdays ("Mon,Wed,Fri", "{Mon,Wed}", "monday tuesday")
        #[arg(long, env = "SPOTTER_TRAINING_DAYS")]
        days: String,
    },
}

#[derive(Args, Debug)]
pub struct RecoverArgs {
    /// Read the model response from a file (use '-' for stdin)
    #[arg(long, short = 'i')]
    input: Option<String>,
    /// Fetch the model response over HTTP (retried, circuit-broken)
    #[arg(long, env = "SPOTTER_PLAN_URL")]
    url: Option<String>,
    /// Client's preferred training weekdays ("Mon,Wed,Fri" or "{Mon,Wed,Fri}")
    #[arg(long, env = "SPOTTER_TRAINING_DAYS")]
    days: String,
    /// First day of the 7-day window (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    start: Option<NaiveDate>,
    /// Model identifier, echoed in logs and errors
    #[arg(long)]
    model: Option<String>,
    /// Fail (exit 1) when only part of the plan could be recovered
    #[arg(long)]
    require_full: bool,
    /// Print only the per-exercise persistence rows
    #[arg(long)]
    rows: bool,
}

pub async fn run(command: PlanCommands) -> i32 {
    match command {
        PlanCommands::Recover(args) => recover(args).await,
        PlanCommands::Days { days } => {
            let preference = WeekdayPreference::parse(&days);
            print_json(&json!({
                "input": days,
                "days": preference.canonical_names(),
                "count": preference.len()
            }))
        }
    }
}

async fn recover(args: RecoverArgs) -> i32 {
    let preference = WeekdayPreference::parse(&args.days);
    if preference.is_empty() {
        tracing::warn!(days = %args.days, "no recognizable training days, every day will be a rest day");
    }
    let start = args
        .start
        .unwrap_or_else(|| chrono::Local::now().date_naive());

    let raw = match (&args.input, &args.url) {
        (Some(path), _) => match read_input(path) {
            Ok(raw) => raw,
            Err(message) => {
                return usage_error(&message, Some("Pass a readable file path or '-' for stdin."));
            }
        },
        (None, Some(url)) => match fetch_response(url).await {
            Ok(raw) => raw,
            Err(err) => {
                print_error(&resilience_envelope(&err));
                return resilience_exit_code(&err);
            }
        },
        (None, None) => {
            return usage_error(
                "A model response is required",
                Some("Use --input <path|-> or --url <URL> (or set SPOTTER_PLAN_URL)."),
            );
        }
    };

    let plan = match recover_model_response(&raw, args.model.as_deref(), &preference, start) {
        Ok(plan) => plan,
        Err(err) => {
            print_error(&ErrorEnvelope::from(&err));
            return EXIT_CLIENT_ERROR;
        }
    };

    if args.require_full {
        if let PlanCompleteness::Partial { diagnosis } = &plan.completeness {
            print_error(
                &ErrorEnvelope::new(
                    codes::PLAN_PARTIAL,
                    format!("Workout plan was only partially recovered: {diagnosis}"),
                )
                .with_field("require_full")
                .with_hint("Regenerate the plan, or drop --require-full to accept partial plans."),
            );
            return EXIT_CLIENT_ERROR;
        }
    }

    if args.rows {
        print_json(&plan.exercises)
    } else {
        print_json(&plan)
    }
}

/// Fetch the raw response body through the deduplicator and retrying executor.
async fn fetch_response(url: &str) -> Result<String, ResilienceError> {
    let config = ResilienceConfig::from_env();
    if config.configured_via_env {
        tracing::debug!(?config, "resilience settings loaded from environment");
    }
    let dedup: OperationDeduplicator<String> = OperationDeduplicator::from_config(&config);
    let descriptor = OperationDescriptor::new(FETCH_OPERATION, json!({ "url": url }));

    let client = reqwest::Client::new();
    let target = url.to_string();
    let outcome = dedup
        .refresh(&descriptor, move || fetch_text(client.clone(), target.clone()))
        .await;

    let stats = dedup.recorder().stats(None);
    tracing::info!(
        url,
        success = outcome.is_ok(),
        duration_ms = stats.max_duration_ms,
        alerts = dedup.recorder().alerts().len(),
        "plan response fetch finished"
    );
    if outcome.is_err() {
        for (key, status) in dedup.executor().circuit_statuses() {
            tracing::warn!(
                key = %key,
                state = ?status.state,
                failure_count = status.failure_count,
                "circuit breaker status after failed fetch"
            );
        }
    }

    match outcome? {
        RefreshOutcome::Completed(body) => Ok(body),
        RefreshOutcome::CoolingDown { retry_in } => Err(ResilienceError::Aborted {
            key: descriptor.key(),
            message: format!("fetch suppressed by cooldown, retry in {}ms", retry_in.as_millis()),
        }),
    }
}

async fn fetch_text(client: reqwest::Client, url: String) -> Result<String, OperationError> {
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| OperationError::Network(e.to_string()))?;
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| OperationError::Network(e.to_string()))?;

    if !status.is_success() {
        let preview: String = body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
        return Err(OperationError::status(status.as_u16(), preview));
    }
    Ok(body)
}
