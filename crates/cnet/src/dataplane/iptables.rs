//! Layer-3/4 rule programming through `iptables` / `ip6tables`.
//!
//! Insertion probes with `-C` first so rules are never duplicated and
//! relative ordering stays stable across re-runs; "already exists" is by
//! definition impossible to hit, and missing rules on delete are tolerated.

use crate::platform::exec::{Exec, Result};

/// Where an ensured rule lands in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Append at the end.
    Append,
    /// Insert at the head.
    Insert,
}

/// iptables rule programmer for one address family.
#[derive(Clone)]
pub struct Iptables {
    exec: Exec,
    program: &'static str,
}

impl Iptables {
    /// IPv4 programmer.
    pub fn v4(exec: Exec) -> Self {
        Self {
            exec,
            program: "iptables",
        }
    }

    /// IPv6 programmer.
    pub fn v6(exec: Exec) -> Self {
        Self {
            exec,
            program: "ip6tables",
        }
    }

    /// Create a chain if it does not exist yet.
    pub async fn ensure_chain(&self, table: &str, chain: &str) -> Result<()> {
        if self
            .exec
            .run(self.program, &["-t", table, "-L", chain, "-n"])
            .await
            .is_ok()
        {
            return Ok(());
        }
        self.exec
            .run(self.program, &["-t", table, "-N", chain])
            .await?;
        Ok(())
    }

    /// Check whether a rule is present.
    pub async fn rule_exists(&self, table: &str, chain: &str, rule: &[&str]) -> bool {
        let mut args = vec!["-t", table, "-C", chain];
        args.extend_from_slice(rule);
        self.exec.run(self.program, &args).await.is_ok()
    }

    /// Install a rule unless it is already present.
    pub async fn ensure_rule(
        &self,
        table: &str,
        chain: &str,
        position: Position,
        rule: &[&str],
    ) -> Result<()> {
        if self.rule_exists(table, chain, rule).await {
            return Ok(());
        }
        let mut args = vec!["-t", table];
        match position {
            Position::Append => args.extend_from_slice(&["-A", chain]),
            Position::Insert => args.extend_from_slice(&["-I", chain]),
        }
        args.extend_from_slice(rule);
        self.exec.run(self.program, &args).await?;
        Ok(())
    }

    /// Remove a rule; missing rules are not an error.
    pub async fn delete_rule(&self, table: &str, chain: &str, rule: &[&str]) {
        let mut args = vec!["-t", table, "-D", chain];
        args.extend_from_slice(rule);
        self.exec.run_tolerated(self.program, &args).await;
    }

    /// Flush and remove a chain; best-effort.
    pub async fn delete_chain(&self, table: &str, chain: &str) {
        self.exec
            .run_tolerated(self.program, &["-t", table, "-F", chain])
            .await;
        self.exec
            .run_tolerated(self.program, &["-t", table, "-X", chain])
            .await;
    }

    /// Hook `chain` from the head of a built-in chain.
    pub async fn ensure_jump(&self, table: &str, builtin: &str, chain: &str) -> Result<()> {
        self.ensure_rule(table, builtin, Position::Insert, &["-j", chain])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_rule_probes_before_insert() {
        let exec = Exec::mock();
        // -C probe fails => rule missing => expect an insert
        exec.fail_on("-C POSTROUTING", "no such rule");
        let ipt = Iptables::v4(exec.clone());

        ipt.ensure_rule(
            "nat",
            "POSTROUTING",
            Position::Append,
            &["-s", "169.254.0.0/16", "-j", "MASQUERADE"],
        )
        .await
        .unwrap();

        let recorded = exec.recorded();
        assert_eq!(recorded.len(), 2);
        assert_eq!(
            recorded[0],
            "iptables -t nat -C POSTROUTING -s 169.254.0.0/16 -j MASQUERADE"
        );
        assert_eq!(
            recorded[1],
            "iptables -t nat -A POSTROUTING -s 169.254.0.0/16 -j MASQUERADE"
        );
    }

    #[tokio::test]
    async fn test_ensure_rule_skips_existing() {
        let exec = Exec::mock();
        let ipt = Iptables::v4(exec.clone());

        // Probe succeeds on the mock by default, so no insert happens.
        ipt.ensure_rule("mangle", "PREROUTING", Position::Insert, &["-j", "ACCEPT"])
            .await
            .unwrap();
        let recorded = exec.recorded();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].contains("-C PREROUTING"));
    }

    #[tokio::test]
    async fn test_ensure_chain_creates_when_listing_fails() {
        let exec = Exec::mock();
        exec.fail_on("-L CNIInputChain", "No chain/target/match by that name");
        let ipt = Iptables::v4(exec.clone());

        ipt.ensure_chain("filter", "CNIInputChain").await.unwrap();
        assert!(exec.saw("iptables -t filter -N CNIInputChain"));
    }

    #[tokio::test]
    async fn test_v6_program_name() {
        let exec = Exec::mock();
        let ipt = Iptables::v6(exec.clone());
        ipt.delete_rule("filter", "FORWARD", &["-j", "ACCEPT"]).await;
        assert!(exec.saw("ip6tables -t filter -D FORWARD -j ACCEPT"));
    }
}
