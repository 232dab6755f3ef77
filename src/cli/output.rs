//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::resource::StackResource;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Resource row for table display.
#[derive(Tabled)]
struct StackRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Stack")]
    stack: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Age")]
    age: String,
}

/// Stack resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Logical ID")]
    logical_id: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a list of resources.
    #[must_use]
    pub fn format_list(&self, resources: &[StackResource]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(resources).unwrap_or_default(),
            OutputFormat::Text => {
                if resources.is_empty() {
                    return String::from("No stack resources found.\n");
                }

                let rows: Vec<StackRow> = resources
                    .iter()
                    .map(|r| StackRow {
                        namespace: r.metadata.namespace.clone(),
                        name: r.metadata.name.clone(),
                        stack: Self::truncate(&r.stack_name(), 40),
                        status: Self::format_status(r),
                        age: Self::format_age(r),
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    /// Formats a single resource with its outputs and stack resources.
    #[must_use]
    pub fn format_resource(&self, resource: &StackResource) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(resource).unwrap_or_default(),
            OutputFormat::Text => Self::format_resource_text(resource),
        }
    }

    fn format_resource_text(resource: &StackResource) -> String {
        let status = &resource.status;
        let mut output = String::new();

        let _ = write!(output, "\nStack resource: {}\n\n", resource.locator());
        let _ = writeln!(output, "   Stack name: {}", resource.stack_name());
        let _ = writeln!(
            output,
            "   Stack ID: {}",
            if status.stack_id.is_empty() { "-" } else { &status.stack_id }
        );
        let _ = writeln!(output, "   Status: {}", Self::format_status(resource));
        let _ = writeln!(output, "   Generation: {}", resource.metadata.generation);
        if let Some(created) = status.created_time {
            let _ = writeln!(output, "   Created: {}", created.format("%Y-%m-%d %H:%M:%S"));
        }
        if let Some(updated) = status.updated_time {
            let _ = writeln!(output, "   Updated: {}", updated.format("%Y-%m-%d %H:%M:%S"));
        }
        if !status.role_arn.is_empty() {
            let _ = writeln!(output, "   Role: {}", status.role_arn);
        }
        if !resource.metadata.finalizers.is_empty() {
            let _ = writeln!(output, "   Finalizers: {}", resource.metadata.finalizers.join(", "));
        }

        if !status.outputs.is_empty() {
            output.push_str("\nOutputs:\n");
            for (key, value) in &status.outputs {
                let _ = writeln!(output, "   {key} = {value}");
            }
        }

        if !status.resources.is_empty() {
            let rows: Vec<ResourceRow> = status
                .resources
                .iter()
                .map(|r| ResourceRow {
                    logical_id: r.logical_id.clone(),
                    resource_type: r.resource_type.clone(),
                    status: Self::color_status(&r.status),
                    physical_id: Self::truncate(r.physical_id.as_deref().unwrap_or("-"), 40),
                })
                .collect();

            output.push_str("\nResources:\n");
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        output
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats a one-line message.
    #[must_use]
    pub fn format_message(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": "success", "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => format!("{} {message}", "✓".green()),
        }
    }

    /// Status column text, including pending deletion.
    fn format_status(resource: &StackResource) -> String {
        let status = if resource.status.stack_status.is_empty() {
            "PENDING".dimmed().to_string()
        } else {
            Self::color_status(&resource.status.stack_status)
        };

        if resource.is_marked_for_deletion() {
            format!("{status} {}", "(deleting)".red())
        } else {
            status
        }
    }

    /// Colors a lifecycle status by outcome.
    fn color_status(status: &str) -> String {
        if status.ends_with("_FAILED") || status.contains("ROLLBACK") {
            status.red().to_string()
        } else if status.ends_with("_IN_PROGRESS") {
            status.yellow().to_string()
        } else if status.ends_with("_COMPLETE") {
            status.green().to_string()
        } else {
            status.to_string()
        }
    }

    fn format_age(resource: &StackResource) -> String {
        let Some(created) = resource.metadata.creation_timestamp else {
            return String::from("-");
        };

        let age = chrono::Utc::now().signed_duration_since(created);
        if age.num_days() > 0 {
            format!("{}d", age.num_days())
        } else if age.num_hours() > 0 {
            format!("{}h", age.num_hours())
        } else if age.num_minutes() > 0 {
            format!("{}m", age.num_minutes())
        } else {
            format!("{}s", age.num_seconds().max(0))
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}
