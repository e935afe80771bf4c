// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Quota commands against a running server
//!
//! Commands: show, defaults, detail, update, delete

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use std::collections::BTreeMap;

use quotad_core::domain::quota::{validate_limit, QuotaDetail, QuotaSet, ResourceKind, UNLIMITED};

use crate::daemon::client::{QuotaClient, Scope};

#[derive(Args, Clone)]
pub struct ScopeArgs {
    /// Limit the request to one user of the project
    #[arg(long, conflicts_with = "share_type")]
    pub user_id: Option<String>,

    /// Limit the request to one share type of the project
    #[arg(long)]
    pub share_type: Option<String>,
}

impl From<ScopeArgs> for Scope {
    fn from(args: ScopeArgs) -> Self {
        Scope {
            user_id: args.user_id,
            share_type: args.share_type,
        }
    }
}

#[derive(Subcommand)]
pub enum QuotaCommand {
    /// Show effective limits
    Show {
        /// Project whose quotas to show
        project: String,

        #[command(flatten)]
        scope: ScopeArgs,

        /// Caller project for the URL prefix (default: same as target)
        #[arg(long)]
        as_project: Option<String>,
    },

    /// Show process-wide default limits
    Defaults {
        project: String,

        #[arg(long)]
        as_project: Option<String>,
    },

    /// Show limits with in-use and reserved counters
    Detail {
        project: String,

        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(long)]
        as_project: Option<String>,
    },

    /// Set limits, e.g. `quotad quota update demo shares=10 gigabytes=-1`
    Update {
        project: String,

        /// RESOURCE=LIMIT pairs; -1 means unlimited
        #[arg(required = true, value_name = "RESOURCE=LIMIT")]
        limits: Vec<String>,

        #[command(flatten)]
        scope: ScopeArgs,

        /// Allow limits below current usage
        #[arg(long)]
        force: bool,

        #[arg(long)]
        as_project: Option<String>,
    },

    /// Remove overrides at a scope, reverting to the next level
    Delete {
        project: String,

        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(long)]
        as_project: Option<String>,
    },
}

pub async fn handle_command(command: QuotaCommand, host: &str, port: u16) -> Result<()> {
    match command {
        QuotaCommand::Show { project, scope, as_project } => {
            let client = client(host, port, &project, as_project)?;
            let response = client.show(&project, &scope.into()).await?;
            print_limits(&response.quota_set.id, &response.quota_set.resources);
        }
        QuotaCommand::Defaults { project, as_project } => {
            let client = client(host, port, &project, as_project)?;
            let response = client.defaults(&project).await?;
            print_limits(&response.quota_set.id, &response.quota_set.resources);
        }
        QuotaCommand::Detail { project, scope, as_project } => {
            let client = client(host, port, &project, as_project)?;
            let response = client.detail(&project, &scope.into()).await?;
            print_detail(&response.quota_set.id, &response.quota_set.resources);
        }
        QuotaCommand::Update { project, limits, scope, force, as_project } => {
            let limits = parse_limits(&limits)?;
            let client = client(host, port, &project, as_project)?;
            let response = client.update(&project, &limits, &scope.into(), force).await?;
            println!("{}", "✓ Quotas updated".green());
            print_limits(&response.quota_set.id, &response.quota_set.resources);
        }
        QuotaCommand::Delete { project, scope, as_project } => {
            let client = client(host, port, &project, as_project)?;
            client.delete(&project, &scope.into()).await?;
            println!("{}", format!("✓ Quota overrides deleted for {}", project).green());
        }
    }
    Ok(())
}

fn client(host: &str, port: u16, project: &str, as_project: Option<String>) -> Result<QuotaClient> {
    QuotaClient::new(host, port, as_project.unwrap_or_else(|| project.to_string()))
}

/// Parse `resource=limit` pairs into a quota set.
pub fn parse_limits(pairs: &[String]) -> Result<QuotaSet> {
    let mut limits = QuotaSet::new();
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected RESOURCE=LIMIT, got '{}'", pair))?;
        let resource: ResourceKind = name.trim().parse()?;
        let limit: i64 = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid limit for {}: '{}'", resource, value))?;
        validate_limit(resource, limit)?;
        limits.insert(resource, limit);
    }
    Ok(limits)
}

fn format_limit(limit: i64) -> String {
    if limit == UNLIMITED {
        "unlimited".to_string()
    } else {
        limit.to_string()
    }
}

fn print_limits(project: &str, limits: &BTreeMap<ResourceKind, i64>) {
    println!("{} {}", "Quotas for".bold(), project.bold());
    for (resource, limit) in limits {
        println!("  {:<24} {}", resource.as_str(), format_limit(*limit));
    }
}

fn print_detail(project: &str, detail: &BTreeMap<ResourceKind, QuotaDetail>) {
    println!("{} {}", "Quota usage for".bold(), project.bold());
    println!(
        "  {:<24} {:>10} {:>10} {:>10}",
        "RESOURCE".dimmed(),
        "LIMIT".dimmed(),
        "IN USE".dimmed(),
        "RESERVED".dimmed()
    );
    for (resource, d) in detail {
        let line = format!(
            "  {:<24} {:>10} {:>10} {:>10}",
            resource.as_str(),
            format_limit(d.limit),
            d.in_use,
            d.reserved
        );
        if d.limit != UNLIMITED && d.in_use + d.reserved >= d.limit {
            println!("{}", line.yellow());
        } else {
            println!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limits() {
        let limits = parse_limits(&["shares=10".to_string(), "gigabytes = -1".to_string()]).unwrap();
        assert_eq!(limits[&ResourceKind::Shares], 10);
        assert_eq!(limits[&ResourceKind::Gigabytes], -1);
    }

    #[test]
    fn test_parse_limits_errors() {
        assert!(parse_limits(&["shares".to_string()]).is_err());
        assert!(parse_limits(&["volumes=3".to_string()]).is_err());
        assert!(parse_limits(&["shares=-2".to_string()]).is_err());
        assert!(parse_limits(&["shares=lots".to_string()]).is_err());
    }
}
