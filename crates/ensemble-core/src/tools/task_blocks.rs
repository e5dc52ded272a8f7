//! `@@@task` block parsing for spec notes.
//!
//! Block grammar:
//!
//! ```text
//! @@@task
//! # Task title
//! ## Objective
//! - what to do
//! ## Scope
//! free text or bullets
//! ## Acceptance Criteria
//! - criterion
//! ## Verification
//! - `command`
//! @@@
//! ```
//!
//! The title comes from the `# ` header; sub-sections are optional. Bullets
//! are stripped of their `- ` markers; verification commands also lose
//! surrounding backticks.

use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub struct TaskBlock {
    pub title: String,
    pub objective: String,
    pub scope: Option<String>,
    pub acceptance_criteria: Vec<String>,
    pub verification_commands: Vec<String>,
    pub parallel_group: Option<String>,
}

/// Extract every `@@@task ... @@@` block from note content.
pub fn parse_task_blocks(content: &str) -> Vec<TaskBlock> {
    let block_re = Regex::new(r"(?s)@@@task\s*\n(.*?)@@@").expect("static regex");
    block_re
        .captures_iter(content)
        .filter_map(|caps| parse_block(caps.get(1).map(|m| m.as_str()).unwrap_or("")))
        .collect()
}

#[derive(PartialEq)]
enum Section {
    None,
    Objective,
    Scope,
    AcceptanceCriteria,
    Verification,
    ParallelGroup,
}

fn parse_block(body: &str) -> Option<TaskBlock> {
    let mut title = String::new();
    let mut objective_lines: Vec<String> = Vec::new();
    let mut scope_lines: Vec<String> = Vec::new();
    let mut acceptance_criteria = Vec::new();
    let mut verification_commands = Vec::new();
    let mut parallel_group = None;
    let mut section = Section::None;

    for raw_line in body.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(heading) = line.strip_prefix("## ") {
            section = match heading.trim().to_lowercase().as_str() {
                "objective" => Section::Objective,
                "scope" => Section::Scope,
                "acceptance criteria" => Section::AcceptanceCriteria,
                "verification" | "verification commands" => Section::Verification,
                "parallel group" => Section::ParallelGroup,
                _ => Section::None,
            };
            continue;
        }
        if let Some(t) = line.strip_prefix("# ") {
            title = t.trim().to_string();
            continue;
        }

        let stripped = line.strip_prefix("- ").unwrap_or(line).trim();
        match section {
            Section::Objective => objective_lines.push(stripped.to_string()),
            Section::Scope => scope_lines.push(stripped.to_string()),
            Section::AcceptanceCriteria => acceptance_criteria.push(stripped.to_string()),
            Section::Verification => {
                verification_commands.push(stripped.trim_matches('`').to_string())
            }
            Section::ParallelGroup => parallel_group = Some(stripped.to_string()),
            Section::None => {}
        }
    }

    if title.is_empty() {
        return None;
    }

    Some(TaskBlock {
        title,
        objective: objective_lines.join("\n"),
        scope: if scope_lines.is_empty() {
            None
        } else {
            Some(scope_lines.join("\n"))
        },
        acceptance_criteria,
        verification_commands,
        parallel_group,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_blocks_with_objectives() {
        let content = "intro text\n@@@task\n# T1\n## Objective\n- do X\n@@@\n@@@task\n# T2\n## Objective\n- do Y\n@@@\ntrailer";
        let blocks = parse_task_blocks(content);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].title, "T1");
        assert_eq!(blocks[0].objective, "do X");
        assert_eq!(blocks[1].title, "T2");
        assert_eq!(blocks[1].objective, "do Y");
    }

    #[test]
    fn parses_full_block() {
        let content = r#"@@@task
# Add login endpoint
## Objective
- expose POST /login
## Scope
only the handler, no UI
## Acceptance Criteria
- returns 200 with token
- rejects bad password
## Verification
- `cargo test login`
@@@"#;
        let blocks = parse_task_blocks(content);
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.title, "Add login endpoint");
        assert_eq!(block.scope.as_deref(), Some("only the handler, no UI"));
        assert_eq!(block.acceptance_criteria.len(), 2);
        assert_eq!(block.verification_commands, vec!["cargo test login"]);
    }

    #[test]
    fn block_without_title_is_dropped() {
        let content = "@@@task\n## Objective\n- orphan\n@@@";
        assert!(parse_task_blocks(content).is_empty());
    }

    #[test]
    fn no_blocks_means_empty() {
        assert!(parse_task_blocks("just a note").is_empty());
    }
}
