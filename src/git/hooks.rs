// Gitkit SSH Server - Repository Hooks
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::config::HookScripts;

/// Write the configured hook scripts into `<repo>/hooks`
pub fn install_hooks(repo_path: &Path, hooks: &HookScripts) -> Result<()> {
    let scripts = hooks.scripts();
    if scripts.is_empty() {
        return Ok(());
    }

    let hooks_dir = repo_path.join("hooks");
    fs::create_dir_all(&hooks_dir)
        .with_context(|| format!("Failed to create hooks directory {:?}", hooks_dir))?;

    for (name, body) in scripts {
        let hook_path = hooks_dir.join(name);
        fs::write(&hook_path, body)
            .with_context(|| format!("Failed to write hook {:?}", hook_path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&hook_path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&hook_path, perms)?;
        }

        debug!("Installed {} hook into {:?}", name, repo_path);
    }

    Ok(())
}
