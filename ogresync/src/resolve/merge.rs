//! Line-level three-way merge for the file resolver.
//!
//! The heavy lifting is diffy's diff3 implementation; on top of it sits a
//! post-pass that resolves conflict regions where one side only reflowed
//! whitespace.

use diffy::{ConflictStyle, MergeOptions};

#[derive(Debug)]
pub struct MergeResult {
    pub content: String,
    pub clean: bool,
}

/// NUL byte within the first 8 KiB marks a file as binary.
pub fn is_binary(content: &[u8]) -> bool {
    content.iter().take(8192).any(|byte| *byte == 0)
}

pub fn three_way_merge(base: &str, ours: &str, theirs: &str) -> MergeResult {
    match MergeOptions::new()
        .set_conflict_style(ConflictStyle::Diff3)
        .merge(base, ours, theirs)
    {
        Ok(content) => MergeResult {
            content,
            clean: true,
        },
        Err(marked) => resolve_whitespace_conflicts(&marked),
    }
}

#[derive(PartialEq)]
enum Region {
    Outside,
    Ours,
    Base,
    Theirs,
}

// Walks the conflict-marked merge output and drops conflict regions in which
// one side differs from the base by whitespace only.
fn resolve_whitespace_conflicts(marked: &str) -> MergeResult {
    let mut output: Vec<&str> = Vec::new();
    let mut ours: Vec<&str> = Vec::new();
    let mut base: Vec<&str> = Vec::new();
    let mut theirs: Vec<&str> = Vec::new();
    let mut region = Region::Outside;
    let mut clean = true;

    for line in marked.lines() {
        match region {
            Region::Outside => {
                if line.starts_with("<<<<<<<") {
                    region = Region::Ours;
                    ours.clear();
                    base.clear();
                    theirs.clear();
                } else {
                    output.push(line);
                }
            }
            Region::Ours => {
                if line.starts_with("|||||||") {
                    region = Region::Base;
                } else if line.starts_with("=======") {
                    region = Region::Theirs;
                } else {
                    ours.push(line);
                }
            }
            Region::Base => {
                if line.starts_with("=======") {
                    region = Region::Theirs;
                } else {
                    base.push(line);
                }
            }
            Region::Theirs => {
                if line.starts_with(">>>>>>>") {
                    region = Region::Outside;
                    match pick_side(&ours, &base, &theirs) {
                        Some(side) => output.extend_from_slice(side),
                        None => {
                            clean = false;
                            output.push("<<<<<<< ours");
                            output.extend_from_slice(&ours);
                            output.push("=======");
                            output.extend_from_slice(&theirs);
                            output.push(">>>>>>> theirs");
                        }
                    }
                } else {
                    theirs.push(line);
                }
            }
        }
    }

    let mut content = output.join("\n");
    if marked.ends_with('\n') && !content.is_empty() {
        content.push('\n');
    }
    MergeResult { content, clean }
}

fn pick_side<'a, 'b>(
    ours: &'a [&'b str],
    base: &'a [&'b str],
    theirs: &'a [&'b str],
) -> Option<&'a [&'b str]> {
    if squeeze(ours) == squeeze(theirs) {
        return Some(ours);
    }
    if squeeze(ours) == squeeze(base) {
        return Some(theirs);
    }
    if squeeze(theirs) == squeeze(base) {
        return Some(ours);
    }
    None
}

fn squeeze(lines: &[&str]) -> String {
    lines
        .iter()
        .flat_map(|line| line.chars())
        .filter(|c| !c.is_whitespace())
        .collect()
}
