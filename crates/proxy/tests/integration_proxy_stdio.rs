//! End-to-end tests: the proxy binary served over stdio, driven by a real
//! MCP client.

mod common;

use common::{call_tool, list_tool_names, result_text, single_server_config, spawn_proxy};
use serde_json::json;
use toolscope_test_support::write_temp_config;

#[tokio::test]
async fn starts_in_configuration_mode_with_admin_tools() -> anyhow::Result<()> {
    let config = write_temp_config(&single_server_config("echo"))?;
    let state = tempfile::tempdir()?;

    let client = spawn_proxy(config.path(), state.path()).await?;
    let names = list_tool_names(&client).await?;

    assert!(names.contains(&"list-available-tools".to_string()));
    assert!(names.contains(&"build-toolset".to_string()));
    assert!(names.contains(&"exit-configuration-mode".to_string()));
    assert!(!names.contains(&"enter-configuration-mode".to_string()));
    assert!(!names.contains(&"srv.echo".to_string()));

    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn build_equip_and_call_through_the_proxy() -> anyhow::Result<()> {
    let config = write_temp_config(&single_server_config("echo"))?;
    let state = tempfile::tempdir()?;
    let client = spawn_proxy(config.path(), state.path()).await?;

    // The downstream's tools are discoverable before any toolset exists.
    let available = call_tool(&client, "list-available-tools", json!({})).await?;
    let listing = result_text(&available);
    assert!(listing.contains("srv.echo"));

    let built = call_tool(
        &client,
        "build-toolset",
        json!({
            "name": "dev",
            "tools": [{ "namespacedName": "srv.echo" }],
            "autoEquip": true,
        }),
    )
    .await?;
    assert_ne!(built.is_error, Some(true));
    assert!(result_text(&built).contains("\"autoEquipped\": true"));

    // Equipping switched to normal mode: toolset tools plus navigation.
    let names = list_tool_names(&client).await?;
    assert_eq!(names, vec!["srv.echo", "enter-configuration-mode"]);

    let result = call_tool(&client, "srv.echo", json!({"msg": "hi"})).await?;
    assert_eq!(result.is_error, Some(false));
    assert!(result_text(&result).contains("hi"));

    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn restart_restores_last_equipped_toolset() -> anyhow::Result<()> {
    let config = write_temp_config(&single_server_config("echo"))?;
    let state = tempfile::tempdir()?;

    let client = spawn_proxy(config.path(), state.path()).await?;
    call_tool(
        &client,
        "build-toolset",
        json!({
            "name": "dev",
            "tools": [{ "namespacedName": "srv.echo" }],
            "autoEquip": true,
        }),
    )
    .await?;
    client.cancel().await?;

    // A fresh process over the same state dir re-equips without any
    // administrative call.
    let client = spawn_proxy(config.path(), state.path()).await?;
    let names = list_tool_names(&client).await?;
    assert_eq!(names, vec!["srv.echo", "enter-configuration-mode"]);

    let result = call_tool(&client, "srv.echo", json!({"msg": "again"})).await?;
    assert!(result_text(&result).contains("again"));

    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn toolset_lifecycle_via_admin_tools() -> anyhow::Result<()> {
    let config = write_temp_config(&single_server_config("echo,sum"))?;
    let state = tempfile::tempdir()?;
    let client = spawn_proxy(config.path(), state.path()).await?;

    call_tool(
        &client,
        "build-toolset",
        json!({
            "name": "dev",
            "tools": [{ "namespacedName": "srv.echo" }],
            "autoEquip": true,
        }),
    )
    .await?;

    // Deleting the equipped toolset is refused.
    let refused = call_tool(&client, "delete-toolset", json!({"name": "dev", "confirm": true})).await?;
    assert_eq!(refused.is_error, Some(true));

    let active = call_tool(&client, "get-active-toolset", json!({})).await?;
    let status = result_text(&active);
    assert!(status.contains("\"active\": true"));
    assert!(status.contains("\"name\": \"dev\""));

    let unequipped = call_tool(&client, "unequip-toolset", json!({})).await?;
    assert_ne!(unequipped.is_error, Some(true));

    let deleted = call_tool(&client, "delete-toolset", json!({"name": "dev", "confirm": true})).await?;
    assert_ne!(deleted.is_error, Some(true));

    let listing = result_text(&call_tool(&client, "list-saved-toolsets", json!({})).await?);
    assert!(listing.contains("\"count\": 0"));

    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn tool_level_failures_pass_through_unchanged() -> anyhow::Result<()> {
    let config = write_temp_config(&single_server_config("echo"))?;
    let state = tempfile::tempdir()?;
    let client = spawn_proxy(config.path(), state.path()).await?;

    call_tool(
        &client,
        "build-toolset",
        json!({
            "name": "dev",
            "tools": [{ "namespacedName": "srv.echo" }],
            "autoEquip": true,
        }),
    )
    .await?;

    let result = call_tool(&client, "srv.echo", json!({"msg": "fail"})).await?;
    assert_eq!(result.is_error, Some(true));
    assert!(result_text(&result).contains("forced failure"));

    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_tools_are_protocol_errors() -> anyhow::Result<()> {
    let config = write_temp_config(&single_server_config("echo"))?;
    let state = tempfile::tempdir()?;
    let client = spawn_proxy(config.path(), state.path()).await?;

    // Configuration mode: downstream tools exist in the catalog but are
    // not exposed, so calling one is a protocol-level error.
    assert!(call_tool(&client, "srv.echo", json!({"msg": "hi"})).await.is_err());
    assert!(call_tool(&client, "no-such-tool", json!({})).await.is_err());

    client.cancel().await?;
    Ok(())
}
