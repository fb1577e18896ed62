use std::collections::HashMap;

use uuid::Uuid;

use crate::types::entities::{Channel, ChannelNode, ChannelOccupant, PresenceEntry};

/// Materialize the flat channel rows into an ordered forest.
///
/// Nodes whose parent id does not resolve to a known channel are promoted to
/// roots instead of being dropped. Roots and children are ordered by
/// ascending position with the id as tiebreaker, so repeated runs over the
/// same rows produce the same forest. Occupants stay empty here; they are
/// filled from presence when the tree is emitted.
pub fn build_channel_tree(channels: &[Channel]) -> Vec<ChannelNode> {
    let by_id: HashMap<Uuid, &Channel> = channels.iter().map(|c| (c.id, c)).collect();

    let mut roots: Vec<Uuid> = Vec::new();
    let mut children_of: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

    for channel in channels {
        match channel.parent_id {
            Some(parent) if by_id.contains_key(&parent) => {
                children_of.entry(parent).or_default().push(channel.id);
            }
            _ => roots.push(channel.id),
        }
    }

    sort_siblings(&mut roots, &by_id);
    for siblings in children_of.values_mut() {
        sort_siblings(siblings, &by_id);
    }

    roots
        .iter()
        .map(|id| assemble(*id, &by_id, &children_of))
        .collect()
}

fn sort_siblings(siblings: &mut [Uuid], by_id: &HashMap<Uuid, &Channel>) {
    siblings.sort_by_key(|id| (by_id[id].position, *id));
}

fn assemble(
    id: Uuid,
    by_id: &HashMap<Uuid, &Channel>,
    children_of: &HashMap<Uuid, Vec<Uuid>>,
) -> ChannelNode {
    let channel = by_id[&id];
    let children = children_of
        .get(&id)
        .map(|child_ids| {
            child_ids
                .iter()
                .map(|child| assemble(*child, by_id, children_of))
                .collect()
        })
        .unwrap_or_default();

    ChannelNode {
        id: channel.id,
        name: channel.name.clone(),
        channel_type: channel.channel_type,
        parent_id: channel.parent_id,
        position: channel.position,
        max_users: channel.max_users,
        children,
        occupants: Vec::new(),
    }
}

/// Fill every node's occupant list from a server presence snapshot.
pub fn populate_occupants(nodes: &mut [ChannelNode], entries: &[PresenceEntry]) {
    let mut by_channel: HashMap<Uuid, Vec<ChannelOccupant>> = HashMap::new();
    for entry in entries {
        if let Some(channel_id) = entry.channel_id {
            by_channel.entry(channel_id).or_default().push(ChannelOccupant {
                user_id: entry.user_id,
                nickname: entry.nickname.clone(),
            });
        }
    }

    fill(nodes, &mut by_channel);
}

fn fill(nodes: &mut [ChannelNode], by_channel: &mut HashMap<Uuid, Vec<ChannelOccupant>>) {
    for node in nodes {
        if let Some(mut occupants) = by_channel.remove(&node.id) {
            occupants.sort_by(|a, b| a.nickname.cmp(&b.nickname).then(a.user_id.cmp(&b.user_id)));
            node.occupants = occupants;
        }
        fill(&mut node.children, by_channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::entities::ChannelType;
    use chrono::Utc;

    fn uuid_from(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn make_channel(id: Uuid, parent_id: Option<Uuid>, position: i32) -> Channel {
        Channel {
            id,
            server_id: uuid_from(0xff),
            name: format!("chan-{position}"),
            channel_type: ChannelType::Text,
            parent_id,
            position,
            max_users: None,
            created_at: Utc::now(),
        }
    }

    fn flatten(nodes: &[ChannelNode], out: &mut Vec<Channel>) {
        for node in nodes {
            out.push(Channel {
                id: node.id,
                server_id: uuid_from(0xff),
                name: node.name.clone(),
                channel_type: node.channel_type,
                parent_id: node.parent_id,
                position: node.position,
                max_users: node.max_users,
                created_at: Utc::now(),
            });
            flatten(&node.children, out);
        }
    }

    #[test]
    fn test_children_sorted_by_position() {
        let root = uuid_from(1);
        let a = uuid_from(2);
        let b = uuid_from(3);
        let rows = vec![
            make_channel(root, None, 0),
            make_channel(a, Some(root), 1),
            make_channel(b, Some(root), 0),
        ];

        let tree = build_channel_tree(&rows);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].id, root);
        let child_ids: Vec<Uuid> = tree[0].children.iter().map(|n| n.id).collect();
        assert_eq!(child_ids, vec![b, a]);
    }

    #[test]
    fn test_dangling_parent_becomes_root() {
        let x = uuid_from(1);
        let y = uuid_from(2);
        let rows = vec![
            make_channel(x, Some(uuid_from(0x99)), 0),
            make_channel(y, None, 1),
        ];

        let tree = build_channel_tree(&rows);
        let root_ids: Vec<Uuid> = tree.iter().map(|n| n.id).collect();
        assert_eq!(root_ids, vec![x, y]);
    }

    #[test]
    fn test_position_ties_break_on_id() {
        let a = uuid_from(1);
        let b = uuid_from(2);
        let rows = vec![make_channel(b, None, 0), make_channel(a, None, 0)];

        let tree = build_channel_tree(&rows);
        let root_ids: Vec<Uuid> = tree.iter().map(|n| n.id).collect();
        assert_eq!(root_ids, vec![a, b]);
    }

    #[test]
    fn test_flatten_build_round_trip() {
        let root = uuid_from(1);
        let mid = uuid_from(2);
        let leaf = uuid_from(3);
        let sibling = uuid_from(4);
        let rows = vec![
            make_channel(root, None, 0),
            make_channel(sibling, None, 1),
            make_channel(mid, Some(root), 0),
            make_channel(leaf, Some(mid), 0),
        ];

        let tree = build_channel_tree(&rows);
        let mut flat = Vec::new();
        flatten(&tree, &mut flat);
        let rebuilt = build_channel_tree(&flat);
        assert_eq!(tree, rebuilt);
    }

    #[test]
    fn test_stable_under_reruns() {
        let rows = vec![
            make_channel(uuid_from(3), None, 2),
            make_channel(uuid_from(1), None, 0),
            make_channel(uuid_from(2), Some(uuid_from(1)), 0),
        ];
        assert_eq!(build_channel_tree(&rows), build_channel_tree(&rows));
    }

    #[test]
    fn test_occupants_attach_to_their_channel_only() {
        let root = uuid_from(1);
        let child = uuid_from(2);
        let rows = vec![make_channel(root, None, 0), make_channel(child, Some(root), 0)];
        let mut tree = build_channel_tree(&rows);

        let entries = vec![
            PresenceEntry {
                user_id: uuid_from(0xa),
                channel_id: Some(child),
                nickname: "ada".into(),
            },
            PresenceEntry {
                user_id: uuid_from(0xb),
                channel_id: None,
                nickname: "brian".into(),
            },
        ];
        populate_occupants(&mut tree, &entries);

        assert!(tree[0].occupants.is_empty());
        assert_eq!(tree[0].children[0].occupants.len(), 1);
        assert_eq!(tree[0].children[0].occupants[0].nickname, "ada");
    }
}
