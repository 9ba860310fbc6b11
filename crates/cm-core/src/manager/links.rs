//! Linking environments for EnvironmentManager

use crate::{CoreError, ErrorCode, Result};
use tracing::info;

use super::{EnvironmentManager, LinkOptions};

impl EnvironmentManager {
    /// Link two environments so each can reach the other by name
    ///
    /// The link is always recorded on `env1`, and on `env2` as well with
    /// `opts.bidirectional`. The network cross-connection is symmetric
    /// either way.
    pub async fn link(&self, env1: &str, env2: &str, opts: LinkOptions) -> Result<()> {
        if env1 == env2 {
            return Err(self_link(env1));
        }

        let mut first = self.get(env1).await?;
        let mut second = self.get(env2).await?;
        if first.id == second.id {
            return Err(self_link(&first.name));
        }

        if first.linked_envs.contains(&second.id) {
            return Err(CoreError::new(
                ErrorCode::LinkExists,
                format!("already linked to {}", second.name),
            )
            .with_env(first.id.as_str(), first.name.as_str()));
        }

        self.networks
            .link_environments(&mut first, &mut second)
            .await?;

        first.linked_envs.insert(second.id.clone());
        if opts.bidirectional {
            second.linked_envs.insert(first.id.clone());
        }
        // Both records may have gained a network
        self.store.save(&mut first)?;
        self.store.save(&mut second)?;

        info!("Linked {} -> {}", first.name, second.name);
        Ok(())
    }

    /// Undo a link in both directions
    ///
    /// Network disconnects are best-effort; the ledger is updated on both
    /// sides regardless.
    pub async fn unlink(&self, env1: &str, env2: &str) -> Result<()> {
        if env1 == env2 {
            return Err(self_link(env1));
        }

        let mut first = self.get(env1).await?;
        let mut second = self.get(env2).await?;
        if first.id == second.id {
            return Err(self_link(&first.name));
        }

        self.networks.unlink_environments(&first, &second).await;

        first.linked_envs.remove(&second.id);
        second.linked_envs.remove(&first.id);
        self.store.save(&mut first)?;
        self.store.save(&mut second)?;

        info!("Unlinked {} and {}", first.name, second.name);
        Ok(())
    }
}

fn self_link(env: &str) -> CoreError {
    CoreError::new(ErrorCode::SelfLink, "cannot link environment to itself").with_env("", env)
}
