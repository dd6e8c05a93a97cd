//! Terminal output: tier-coloured results and a progress bar for bulk runs.

use chrono::{DateTime, Utc};
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use leadflow::lead::Tier;
use leadflow::qualification::{BulkItem, QualificationResult, QualificationTier};
use leadflow::scheduler::TickReport;
use leadflow::scoring::ScoreResult;

/// Styled printer for command results.
pub struct Console {
    hot: Style,
    warm: Style,
    cold: Style,
    dim: Style,
    green: Style,
    red: Style,
    bold: Style,
}

impl Default for Console {
    fn default() -> Self {
        Self {
            hot: Style::new().red().bold(),
            warm: Style::new().yellow().bold(),
            cold: Style::new().cyan(),
            dim: Style::new().dim(),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            bold: Style::new().bold(),
        }
    }
}

impl Console {
    fn tier_style(&self, tier: Option<Tier>) -> &Style {
        match tier {
            Some(Tier::Hot) => &self.hot,
            Some(Tier::Warm) => &self.warm,
            Some(Tier::Cold) => &self.cold,
            Some(Tier::Trash) | None => &self.dim,
        }
    }

    pub fn print_score(&self, result: &ScoreResult) {
        let style = self.tier_style(result.classification);
        println!(
            "{} {:.2} {}",
            self.bold.apply_to("Score"),
            result.final_score,
            style.apply_to(result.classification_label())
        );
        println!(
            "  algorithmic {:.2}  contextual {:.2}  predictive {:.2}",
            result.breakdown.algorithmic, result.breakdown.contextual, result.breakdown.predictive
        );
        println!(
            "  confidence {:.2}  est. value ${:.0}  next: {:?}",
            result.confidence, result.estimated_value.estimated_value_usd, result.next_action
        );
    }

    pub fn print_qualification(&self, name: &str, result: &QualificationResult) {
        let style = self.tier_style(Some(result.tier.grade()));
        println!(
            "{} {} {:.2} {}",
            self.green.apply_to("✓"),
            self.bold.apply_to(name),
            result.final_score,
            style.apply_to(result.tier)
        );
        for rec in &result.recommendations {
            println!("    {} {rec}", self.dim.apply_to("•"));
        }
        for action in &result.next_actions {
            println!(
                "    {} {:?} ({:?}) by {}",
                self.dim.apply_to("→"),
                action.kind,
                action.priority,
                action.due_by.format("%Y-%m-%d %H:%M UTC")
            );
        }
    }

    pub fn print_failure(&self, what: &str, error: &dyn std::fmt::Display) {
        println!("{} {what}: {error}", self.red.apply_to("✗"));
    }

    pub fn print_tick(&self, report: &TickReport) {
        match report.process {
            Some(p) => println!(
                "{} examined {}, queued {}, skipped {}, deferred {}, completed {}, stopped {}",
                self.bold.apply_to("process"),
                p.examined,
                p.sends_queued,
                p.skipped,
                p.deferred,
                p.completed,
                p.stopped
            ),
            None => println!("{} failed", self.red.apply_to("process")),
        }
        match report.dispatch {
            Some(d) if d.busy => println!("{} busy", self.dim.apply_to("dispatch")),
            Some(d) => println!(
                "{} sent {}, failed {}, abandoned {}",
                self.bold.apply_to("dispatch"),
                self.green.apply_to(d.sent),
                d.failed,
                d.abandoned
            ),
            None => println!("{} failed", self.red.apply_to("dispatch")),
        }
    }

    pub fn print_window(&self, requested: DateTime<Utc>, adjusted: DateTime<Utc>) {
        if requested == adjusted {
            println!("{} {}", self.green.apply_to("in window"), adjusted.to_rfc3339());
        } else {
            println!(
                "{} {} {} {}",
                self.warm.apply_to("moved"),
                requested.to_rfc3339(),
                self.dim.apply_to("→"),
                adjusted.to_rfc3339()
            );
        }
    }
}

/// Progress bar for bulk qualification.
pub struct BulkProgress {
    pb: ProgressBar,
}

impl BulkProgress {
    pub fn start(len: u64) -> Self {
        let pb = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar().template("{bar:30.cyan} {pos}/{len} {msg}") {
            pb.set_style(style);
        }
        Self { pb }
    }

    pub fn item(&self, item: &BulkItem) {
        let msg = match &item.outcome {
            Ok(r) if r.tier == QualificationTier::Unqualified => format!("{} unqualified", item.lead_id),
            Ok(r) => format!("{} {}", item.lead_id, r.tier),
            Err(e) => format!("{} failed: {e}", item.lead_id),
        };
        self.pb.set_message(msg);
        self.pb.inc(1);
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}
