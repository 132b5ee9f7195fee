/// Judge - scores sandbox results against expected outputs
///
/// Pure: knows nothing about HTTP or containers.
/// - each case passes when trimmed stdout equals trimmed expected output
/// - score = sum of weights of passed cases, max_score = sum of all weights
use sandbox_common::{ExecutionResult, ExecutionStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestCase {
    #[serde(default)]
    pub input: String,
    pub expected_output: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Passed,
    Failed,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub index: usize,
    pub verdict: Verdict,
    pub weight: u32,
    pub runtime_ms: u64,
    pub expected: String,
    pub actual: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JudgeReport {
    pub cases: Vec<CaseReport>,
    pub score: u32,
    pub max_score: u32,
}

impl JudgeReport {
    pub fn passed(&self) -> usize {
        self.cases
            .iter()
            .filter(|c| c.verdict == Verdict::Passed)
            .count()
    }

    pub fn all_passed(&self) -> bool {
        self.passed() == self.cases.len()
    }
}

pub fn verdict(case: &TestCase, result: &ExecutionResult) -> Verdict {
    match result.status {
        ExecutionStatus::Timeout => Verdict::Timeout,
        ExecutionStatus::Error => Verdict::Error,
        ExecutionStatus::Success if result.stdout.trim() == case.expected_output.trim() => {
            Verdict::Passed
        }
        ExecutionStatus::Success => Verdict::Failed,
    }
}

/// `results[i]` is the sandbox result for `cases[i]`
pub fn evaluate(cases: &[TestCase], results: &[ExecutionResult]) -> JudgeReport {
    let max_score = cases.iter().map(|c| c.weight).sum();
    let mut score = 0;

    let reports = cases
        .iter()
        .zip(results)
        .enumerate()
        .map(|(index, (case, result))| {
            let verdict = verdict(case, result);
            if verdict == Verdict::Passed {
                score += case.weight;
            }
            CaseReport {
                index: index + 1,
                verdict,
                weight: case.weight,
                runtime_ms: result.runtime_ms,
                expected: case.expected_output.trim().to_string(),
                actual: result.stdout.trim().to_string(),
                stderr: result.stderr.clone(),
            }
        })
        .collect();

    JudgeReport {
        cases: reports,
        score,
        max_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(input: &str, expected: &str, weight: u32) -> TestCase {
        TestCase {
            input: input.to_string(),
            expected_output: expected.to_string(),
            weight,
        }
    }

    fn finished(status: ExecutionStatus, stdout: &str) -> ExecutionResult {
        ExecutionResult {
            status,
            stdout: stdout.to_string(),
            stderr: String::new(),
            runtime_ms: 40,
            memory_kb: 1024,
            killed: status == ExecutionStatus::Timeout,
            truncated: false,
        }
    }

    #[test]
    fn test_all_pass() {
        let cases = vec![case("5", "120", 10), case("3", "6", 15)];
        let results = vec![
            finished(ExecutionStatus::Success, "120\n"),
            finished(ExecutionStatus::Success, "6"),
        ];

        let report = evaluate(&cases, &results);

        assert_eq!(report.score, 25);
        assert_eq!(report.max_score, 25);
        assert!(report.all_passed());
    }

    #[test]
    fn test_partial_pass() {
        let cases = vec![case("1", "5", 10), case("2", "10", 20)];
        let results = vec![
            finished(ExecutionStatus::Success, "5"),
            finished(ExecutionStatus::Success, "11"),
        ];

        let report = evaluate(&cases, &results);

        assert_eq!(report.score, 10);
        assert_eq!(report.max_score, 30);
        assert_eq!(report.passed(), 1);
        assert_eq!(report.cases[1].verdict, Verdict::Failed);
        assert_eq!(report.cases[1].actual, "11");
    }

    #[test]
    fn test_error_and_timeout_never_pass() {
        let cases = vec![case("", "", 5), case("", "", 5)];
        let results = vec![
            finished(ExecutionStatus::Error, ""),
            finished(ExecutionStatus::Timeout, ""),
        ];

        let report = evaluate(&cases, &results);

        assert_eq!(report.score, 0);
        assert_eq!(report.cases[0].verdict, Verdict::Error);
        assert_eq!(report.cases[1].verdict, Verdict::Timeout);
    }

    #[test]
    fn test_whitespace_is_trimmed_on_both_sides() {
        let c = case("", "  hello world \n", 1);
        assert_eq!(
            verdict(&c, &finished(ExecutionStatus::Success, "\nhello world\n\n")),
            Verdict::Passed
        );
    }

    #[test]
    fn test_cases_file_defaults() {
        let cases: Vec<TestCase> =
            serde_json::from_str(r#"[{"expected_output": "3"}, {"input": "2", "expected_output": "4", "weight": 7}]"#)
                .unwrap();

        assert_eq!(cases[0].input, "");
        assert_eq!(cases[0].weight, 1);
        assert_eq!(cases[1].weight, 7);
    }
}
