use std::process::Command;

use anyhow::{Context, Result};

const PACKAGE: &str = "proccache";

/// Feature sets checked with `--no-default-features`; `None` keeps defaults.
const FEATURE_COMBINATIONS: &[Option<&[&str]>] = &[
    None,
    Some(&[]),
    Some(&["foundation"]),
    Some(&["runtime"]),
    Some(&["test-utils"]),
];

fn label(features: Option<&[&str]>) -> String {
    match features {
        None => "default".to_string(),
        Some([]) => "none".to_string(),
        Some(list) => list.join(","),
    }
}

/// Check that every feature tier compiles on its own.
pub fn test_feature_matrix() -> Result<()> {
    println!("Testing {} {PACKAGE} feature combinations...", FEATURE_COMBINATIONS.len());

    for (index, features) in FEATURE_COMBINATIONS.iter().copied().enumerate() {
        let display_label = label(features);

        let mut command = Command::new("cargo");
        command.args(["check", "-p", PACKAGE, "--all-targets"]);
        if let Some(list) = features {
            command.arg("--no-default-features");
            if !list.is_empty() {
                command.arg("--features").arg(list.join(","));
            }
        }

        println!(
            "\n[{}/{}] {PACKAGE} with features '{display_label}'",
            index + 1,
            FEATURE_COMBINATIONS.len()
        );

        let status = command
            .status()
            .with_context(|| format!("Failed to run cargo check for '{display_label}'"))?;

        if !status.success() {
            anyhow::bail!("Feature combination '{display_label}' failed to compile");
        }

        println!("✅ Features '{display_label}' compiled successfully");
    }

    println!("\n✅ All {} feature combinations compile successfully!", FEATURE_COMBINATIONS.len());

    Ok(())
}
