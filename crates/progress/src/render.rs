//! Text rendering of trackers and tracker trees.

use std::sync::Arc;

use crate::tracker::{ProgressStatus, ProgressTracker};
use crate::tree::ScopeTree;

/// Number of cells in a progress bar.
pub const BAR_WIDTH: usize = 38;

/// `MM:SS` of a number of seconds. Minutes are not wrapped into hours.
pub fn format_clock(secs: f64) -> String {
    let total = secs.max(0.0).floor() as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// One-line bar, e.g. `page[0] 3/10 [███.......] 1.50/s, Elapsed: 00:02, ETA: 00:04`.
pub fn render_bar(status: &ProgressStatus) -> String {
    let mut out = String::new();
    if let Some(name) = &status.name {
        out.push_str(name);
        out.push(' ');
    }

    let done = status.current - status.start;
    match status.max {
        Some(max) => out.push_str(&format!("{}/{} ", done, max - status.start)),
        None => out.push_str(&format!("{}/? ", done)),
    }

    out.push('[');
    match status.percentage {
        Some(percentage) => {
            let filled = BAR_WIDTH as f64 * percentage;
            for cell in 0..BAR_WIDTH {
                out.push(if (cell as f64) < filled { '█' } else { '.' });
            }
        }
        None => out.push_str(&"?".repeat(BAR_WIDTH)),
    }
    out.push_str("] ");

    out.push_str(&format!(
        "{:.2}/s, Elapsed: {}",
        status.rate,
        format_clock(status.elapsed_secs)
    ));
    if let Some(eta) = status.eta_secs {
        out.push_str(&format!(", ETA: {}", format_clock(eta)));
    }
    out
}

/// One bar per live tracker, in hierarchy order, tab-indented by depth.
pub fn render_tree(tree: &ScopeTree<Arc<ProgressTracker>>) -> String {
    let mut out = String::new();
    for (depth, node) in tree.walk() {
        let Some(tracker) = &node.data else {
            continue;
        };
        out.push_str(&"\t".repeat(depth.saturating_sub(1)));
        out.push_str(&render_bar(&tracker.status()));
        out.push('\n');
    }
    out
}
