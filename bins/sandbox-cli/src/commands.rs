use anyhow::{Context, Result};
use sandbox_common::{ExecutionResult, ExecutionStatus, SubmitRequest};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::client::{ApiClient, JobPoll};
use crate::judge::{self, TestCase, Verdict};

pub struct PollSettings {
    pub interval: Duration,
    pub max_wait: Duration,
}

fn read_source(file: &Path) -> Result<String> {
    std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read source file {}", file.display()))
}

/// Submit one program and print its result
pub async fn run(
    client: &ApiClient,
    language: &str,
    file: &Path,
    input: Option<String>,
    timeout: Option<u64>,
    wait: bool,
    poll: &PollSettings,
) -> Result<()> {
    let request = SubmitRequest {
        language: Some(language.to_string()),
        code: Some(read_source(file)?),
        input,
        timeout,
    };

    let job_id = client.submit(&request).await?;
    println!("📨 Job queued: {}", job_id);
    if !wait {
        println!("\n💡 Check it with: sandbox-cli status {}", job_id);
        return Ok(());
    }

    let result = client.wait(job_id, poll.interval, poll.max_wait).await?;
    print_result(&result);
    Ok(())
}

pub async fn status(client: &ApiClient, job_id: Uuid) -> Result<()> {
    match client.poll(job_id).await? {
        JobPoll::Pending(state) => println!("⏳ Job {} is {}", job_id, state),
        JobPoll::Finished(result) => print_result(&result),
        JobPoll::NotFound => println!("❌ Job {} not found (unknown or expired)", job_id),
    }
    Ok(())
}

pub async fn languages(client: &ApiClient) -> Result<()> {
    let languages = client.languages().await?;
    println!("📋 Supported Languages:\n");
    for language in &languages.supported {
        println!("  • {}", language);
    }
    println!("\n✅ Total: {} language(s)", languages.count);
    Ok(())
}

pub async fn stats(client: &ApiClient) -> Result<()> {
    let stats = client.stats().await?;
    println!("📊 Queue Statistics:\n");
    println!("  {:<10} {}", "waiting", stats.waiting);
    println!("  {:<10} {}", "active", stats.active);
    println!("  {:<10} {}", "completed", stats.completed);
    println!("  {:<10} {}", "failed", stats.failed);
    println!("  {}", "─".repeat(16));
    println!("  {:<10} {}", "total", stats.total);
    Ok(())
}

/// One job per test case; all submitted first, then polled in order
pub async fn judge(
    client: &ApiClient,
    language: &str,
    file: &Path,
    cases_file: &Path,
    timeout: Option<u64>,
    poll: &PollSettings,
) -> Result<bool> {
    let code = read_source(file)?;
    let raw = std::fs::read_to_string(cases_file)
        .with_context(|| format!("Failed to read test cases {}", cases_file.display()))?;
    let cases: Vec<TestCase> = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid test cases in {}", cases_file.display()))?;

    println!("⚖️  Judging {} against {} test case(s)", file.display(), cases.len());

    let mut job_ids = Vec::with_capacity(cases.len());
    for case in &cases {
        let request = SubmitRequest {
            language: Some(language.to_string()),
            code: Some(code.clone()),
            input: Some(case.input.clone()),
            timeout,
        };
        job_ids.push(client.submit(&request).await?);
    }

    let mut results = Vec::with_capacity(job_ids.len());
    for job_id in job_ids {
        results.push(client.wait(job_id, poll.interval, poll.max_wait).await?);
    }

    let report = judge::evaluate(&cases, &results);
    println!();
    for case in &report.cases {
        let (icon, label) = match case.verdict {
            Verdict::Passed => ("✅", "passed"),
            Verdict::Failed => ("❌", "wrong answer"),
            Verdict::Error => ("💥", "runtime error"),
            Verdict::Timeout => ("⏱️ ", "time limit exceeded"),
        };
        println!(
            "  {} Test {} (weight {}) → {} [{}ms]",
            icon, case.index, case.weight, label, case.runtime_ms
        );
        if case.verdict == Verdict::Failed {
            println!("     Expected: \"{}\"", case.expected);
            println!("     Got:      \"{}\"", case.actual);
        }
        if case.verdict == Verdict::Error && !case.stderr.is_empty() {
            println!("     {}", first_line(&case.stderr));
        }
    }

    println!();
    println!(
        "🏁 Score: {} / {} ({} of {} passed)",
        report.score,
        report.max_score,
        report.passed(),
        report.cases.len()
    );
    Ok(report.all_passed())
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("")
}

fn print_result(result: &ExecutionResult) {
    let icon = match result.status {
        ExecutionStatus::Success => "✅",
        ExecutionStatus::Error => "❌",
        ExecutionStatus::Timeout => "⏱️ ",
    };
    println!(
        "{} {} in {}ms, {} KB peak{}",
        icon,
        result.status,
        result.runtime_ms,
        result.memory_kb,
        if result.killed { ", killed" } else { "" }
    );
    if !result.stdout.is_empty() {
        println!("\n── stdout ──\n{}", result.stdout.trim_end());
    }
    if !result.stderr.is_empty() {
        println!("\n── stderr ──\n{}", result.stderr.trim_end());
    }
    if result.truncated {
        println!("\n⚠️  Output was truncated");
    }
}
