//! Console prompts for human gate decisions.

use capstan_types::{Decision, PendingDecision};

/// Fields worth showing a reviewer at the gate, when present.
const REVIEW_FIELDS: &[&str] = &["title", "mapping", "transformed", "analysis"];

pub fn show_pending(pending: &PendingDecision) {
    println!("\n=== {} ===", pending.gate);
    println!("{}", pending.prompt);
    for field in REVIEW_FIELDS {
        if let Some(value) = pending.state.get_str(field) {
            println!("\n--- {field} ---\n{value}");
        }
    }
}

/// Ask for a verdict on stdin. `1`/`approve` approves, `2`/`revise` asks for
/// feedback on a second line, `3`/`reject` aborts.
pub fn ask(pending: &PendingDecision) -> anyhow::Result<Decision> {
    show_pending(pending);
    loop {
        println!("\n  [1] Approve\n  [2] Revise\n  [3] Reject");
        let input = read_line()?;
        match input.trim() {
            "1" | "approve" | "a" => return Ok(Decision::approve()),
            "2" | "revise" | "r" => {
                println!("Feedback:");
                let feedback = read_line()?;
                return Ok(Decision::revise(feedback.trim()));
            }
            "3" | "reject" | "x" => return Ok(Decision::reject()),
            other => println!("Unrecognized choice '{other}'"),
        }
    }
}

fn read_line() -> anyhow::Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input)
}
