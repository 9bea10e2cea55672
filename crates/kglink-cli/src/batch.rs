//! Line-delimited batch linking.
//!
//! Each input line is a JSON request `{"qid"?, "text" | "mention",
//! "expected_types"?, "topk"?}`. Each output line carries the request's `qid`
//! and `text` plus either `candidates` or `error`.

use std::io::Write as _;

use eyre::WrapErr as _;

#[derive(Debug, serde::Deserialize)]
struct Request {
    #[serde(default)]
    qid: Option<serde_json::Value>,
    #[serde(default, alias = "mention")]
    text: Option<String>,
    #[serde(default)]
    expected_types: Vec<String>,
    #[serde(default)]
    topk: Option<usize>,
}

#[derive(Debug, serde::Serialize)]
struct Response {
    qid: serde_json::Value,
    text: Option<String>,
    #[serde(flatten)]
    outcome: Outcome,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "lowercase")]
enum Outcome {
    Candidates(Vec<kglink_core::LinkCandidate>),
    Error(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub requests: usize,
    pub linked: usize,
    pub failed: usize,
}

/// Link every request in `input`, writing one response line per request.
///
/// A request that fails is written as an error record and counted; it does
/// not stop the batch.
pub fn run(
    linker: &kglink_linker::TypeAwareLinker<'_>,
    input: impl std::io::BufRead,
    output: impl std::io::Write,
    default_topk: usize,
) -> eyre::Result<Summary> {
    let mut output = std::io::BufWriter::new(output);
    let mut summary = Summary::default();

    for (i, line) in input.lines().enumerate() {
        let line_no = i + 1;
        let line = line.wrap_err_with(|| format!("failed to read input line {line_no}"))?;
        if line.trim().is_empty() {
            continue;
        }

        summary.requests += 1;
        let response = respond(linker, &line, line_no, default_topk);
        match &response.outcome {
            Outcome::Candidates(_) => summary.linked += 1,
            Outcome::Error(e) => {
                tracing::warn!(line = line_no, qid = %response.qid, "{e}");
                summary.failed += 1;
            }
        }

        serde_json::to_writer(&mut output, &response)
            .wrap_err_with(|| format!("failed to write response for line {line_no}"))?;
        output.write_all(b"\n")?;
    }

    output.flush().wrap_err("failed to flush output")?;
    tracing::info!(
        requests = summary.requests,
        linked = summary.linked,
        failed = summary.failed,
        "batch complete"
    );
    Ok(summary)
}

fn respond(
    linker: &kglink_linker::TypeAwareLinker<'_>,
    line: &str,
    line_no: usize,
    default_topk: usize,
) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return Response {
                qid: line_no.into(),
                text: None,
                outcome: Outcome::Error(format!("invalid request: {e}")),
            };
        }
    };

    let qid = request.qid.unwrap_or_else(|| line_no.into());
    let Some(text) = request.text else {
        return Response {
            qid,
            text: None,
            outcome: Outcome::Error("request has no `text` or `mention`".to_string()),
        };
    };

    let k = request.topk.unwrap_or(default_topk);
    let outcome = match linker.link(&text, request.expected_types.as_slice(), k) {
        Ok(candidates) => Outcome::Candidates(candidates),
        Err(e) => Outcome::Error(e.to_string()),
    };
    Response {
        qid,
        text: Some(text),
        outcome,
    }
}
