//! Policy compaction and content-addressed naming.

use std::collections::{BTreeMap, BTreeSet};

use md5::{Digest, Md5};

use super::PolicyConfig;
use crate::rpc::messages::PolicyResource;
use crate::types::{Action, ResourceIdentifier};

/// Merge policies that share principals and actions into one policy per
/// group whose resources are the union of the group's resources.
///
/// The output is canonical: every list is sorted and de-duplicated, and
/// groups are ordered by their key.
pub fn compact<'a>(policies: impl IntoIterator<Item = &'a PolicyResource>) -> Vec<PolicyConfig> {
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();
    for policy in policies {
        let principals: BTreeSet<ResourceIdentifier> = policy.principals.iter().cloned().collect();
        let actions: BTreeSet<Action> = policy.actions.iter().copied().collect();
        let key = group_key(&principals, &actions);

        let group = groups.entry(key).or_insert_with(|| Group {
            principals,
            actions,
            resources: BTreeSet::new(),
        });
        group.resources.extend(policy.resources.iter().cloned());
    }

    groups
        .into_values()
        .map(|group| PolicyConfig {
            principals: group.principals.into_iter().collect(),
            actions: group.actions.into_iter().collect(),
            resources: group.resources.into_iter().collect(),
        })
        .collect()
}

struct Group {
    principals: BTreeSet<ResourceIdentifier>,
    actions: BTreeSet<Action>,
    resources: BTreeSet<ResourceIdentifier>,
}

fn group_key(principals: &BTreeSet<ResourceIdentifier>, actions: &BTreeSet<Action>) -> String {
    let principals: Vec<String> = principals
        .iter()
        .map(|p| format!("{}:{}", p.kind, p.name))
        .collect();
    let actions: Vec<&str> = actions.iter().map(Action::as_str).collect();
    format!("{}|{}", principals.join(","), actions.join(","))
}

/// MD5 hex digest of the policy's JSON form.
pub fn policy_name(policy: &PolicyConfig) -> serde_json::Result<String> {
    let encoded = serde_json::to_vec(policy)?;
    Ok(hex::encode(Md5::digest(&encoded)))
}
