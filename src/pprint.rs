use crate::cost::CostBreakdown;
use crate::graph::Graph;
use crate::loop_nest::LoopNest;

use prettytable::{self, format, row, Cell, Table};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum PrintMode {
    /// The loop nest and the per-node cost table.
    Full,
    /// The loop nest only.
    Tree,
    Off,
}

pub fn pprint(root: &LoopNest, graph: &Graph, breakdown: &CostBreakdown, mode: PrintMode) {
    if mode == PrintMode::Off {
        return;
    }
    print!("{}", root.dump(graph));
    if mode == PrintMode::Full {
        println!();
        cost_table(graph, breakdown).printstd();
    }
}

/// Builds a table with one row per computed node and a final total row.
pub fn cost_table(graph: &Graph, breakdown: &CostBreakdown) -> Table {
    let mut table = Table::new();
    table.set_titles(row![
        "Node",
        "Points",
        "Recompute",
        "Compute",
        "Memory",
        "Parallel",
        "Working set",
        "Cost"
    ]);

    for (node, cost) in graph.nodes().iter().zip(&breakdown.nodes) {
        if node.is_input() {
            continue;
        }
        let mut name = node.name.clone();
        if cost.estimated {
            name.push_str(" (est.)");
        } else if cost.inlined_calls > 0.0 {
            name.push_str(" (inlined)");
        }
        let recompute = cost
            .recompute_ratio()
            .map_or_else(|| "-".to_string(), |r| format!("{:.2}", r));
        let mut r = row![name, format!("{:.0}", cost.points), recompute];
        for v in [
            cost.compute,
            cost.memory,
            cost.parallel_overhead,
            cost.working_set,
            cost.total(),
        ] {
            r.add_cell(Cell::new(&format!("{: >10.0}", v)));
        }
        table.add_row(r);
    }

    let mut total = row!["total", "", ""];
    for _ in 0..4 {
        total.add_cell(Cell::new(""));
    }
    total.add_cell(Cell::new(&format!("{: >10.0}", breakdown.total())));
    table.add_row(total);

    // Format the table.
    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}
