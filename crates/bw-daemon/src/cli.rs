//! Thin HTTP clients for the management API commands.

use anyhow::{bail, Context};

use bw_core::PeerId;

use crate::config::{ClearLimitArgs, ClientArgs, UpdateDefaultLimitArgs, UpdateLimitArgs};
use crate::rpc::{ErrorResponse, ListLimitsResponse};

pub async fn list_limits(args: &ClientArgs) -> anyhow::Result<()> {
    let url = format!("{}/api/limits", args.rpc);
    let response = check(reqwest::get(&url).await?).await?;
    let limits: ListLimitsResponse = response.json().await?;

    println!("{}", serde_json::to_string_pretty(&limits)?);
    Ok(())
}

pub async fn update_limit(args: &UpdateLimitArgs) -> anyhow::Result<()> {
    let node: PeerId = args.node.parse().context("invalid node key")?;
    let limit = args.limit.to_limit()?;

    let url = format!("{}/api/limits/{node}", args.client.rpc);
    let response = reqwest::Client::new().put(&url).json(&limit).send().await?;
    check(response).await?;
    Ok(())
}

pub async fn clear_limit(args: &ClearLimitArgs) -> anyhow::Result<()> {
    let node: PeerId = args.node.parse().context("invalid node key")?;

    let url = format!("{}/api/limits/{node}", args.client.rpc);
    let response = reqwest::Client::new().delete(&url).send().await?;
    check(response).await?;
    Ok(())
}

pub async fn update_default_limit(args: &UpdateDefaultLimitArgs) -> anyhow::Result<()> {
    let limit = args.limit.to_limit()?;

    let url = format!("{}/api/limits/default", args.client.rpc);
    let response = reqwest::Client::new().put(&url).json(&limit).send().await?;
    check(response).await?;
    Ok(())
}

async fn check(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .json::<ErrorResponse>()
        .await
        .map(|body| body.error)
        .unwrap_or_else(|_| status.to_string());
    bail!("request failed: {message}");
}
