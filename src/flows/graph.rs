//! Adjacency view over a flow and the traversal helpers built on it.
//!
//! Flow graphs are legitimately cyclic (LOOP bodies, GOTO jumps), so every
//! helper here walks iteratively with an explicit queue and a visited set.

use std::collections::{HashMap, HashSet, VecDeque};

use super::{Block, Connection, Flow};

/// Blocks keyed by id plus connections indexed by source block id.
#[derive(Debug)]
pub struct FlowGraph {
    blocks: HashMap<String, Block>,
    adjacency: HashMap<String, Vec<Connection>>,
}

impl FlowGraph {
    /// Build the adjacency view. Fails with the offending ids when a
    /// connection references a block that does not exist.
    pub fn build(flow: &Flow) -> Result<Self, Vec<String>> {
        let blocks: HashMap<String, Block> =
            flow.blocks.iter().map(|b| (b.id.clone(), b.clone())).collect();

        let mut dangling = Vec::new();
        let mut adjacency: HashMap<String, Vec<Connection>> = HashMap::new();
        for conn in &flow.connections {
            if !blocks.contains_key(&conn.source_block) {
                dangling.push(conn.source_block.clone());
                continue;
            }
            if !blocks.contains_key(&conn.target_block) {
                dangling.push(conn.target_block.clone());
                continue;
            }
            adjacency
                .entry(conn.source_block.clone())
                .or_default()
                .push(conn.clone());
        }

        if dangling.is_empty() {
            Ok(Self { blocks, adjacency })
        } else {
            Err(dangling)
        }
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn block_ids(&self) -> impl Iterator<Item = &str> {
        self.blocks.keys().map(String::as_str)
    }

    /// Connections leaving a specific port of a block.
    pub fn follow_connections(&self, block_id: &str, port: &str) -> Vec<&Connection> {
        self.adjacency
            .get(block_id)
            .map(|conns| conns.iter().filter(|c| c.source_port == port).collect())
            .unwrap_or_default()
    }

    /// Target block ids reachable from a specific port.
    pub fn next_blocks(&self, block_id: &str, port: &str) -> Vec<&str> {
        self.follow_connections(block_id, port)
            .into_iter()
            .map(|c| c.target_block.as_str())
            .collect()
    }

    /// First target on a port, the path the interpreter follows.
    pub fn first_target(&self, block_id: &str, port: &str) -> Option<&str> {
        self.next_blocks(block_id, port).into_iter().next()
    }

    fn outgoing(&self, block_id: &str) -> &[Connection] {
        self.adjacency.get(block_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// BFS over outgoing connections.
    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            for conn in self.outgoing(current) {
                if conn.target_block == to {
                    return true;
                }
                if !visited.contains(conn.target_block.as_str()) {
                    queue.push_back(&conn.target_block);
                }
            }
        }
        false
    }

    /// Would adding the edge src → dst close a cycle? Checked by the editor
    /// before accepting a connection, not during execution.
    pub fn would_create_cycle(&self, src: &str, dst: &str) -> bool {
        self.can_reach(dst, src)
    }

    /// Every block reachable from `start`, including `start` itself.
    pub fn all_reachable(&self, start: &str) -> HashSet<String> {
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::from([start.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !reachable.insert(current.clone()) {
                continue;
            }
            for conn in self.outgoing(&current) {
                if !reachable.contains(&conn.target_block) {
                    queue.push_back(conn.target_block.clone());
                }
            }
        }
        reachable
    }

    /// Blocks with no outgoing connections at all.
    pub fn terminal_blocks(&self) -> Vec<&str> {
        self.blocks
            .keys()
            .filter(|id| self.outgoing(id).is_empty())
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::{BlockKind, port};

    fn diamond() -> Flow {
        // start → a → b → end, with a second edge a → end ("false" branch).
        Flow::new("f", "diamond")
            .with_block("start", BlockKind::Start)
            .with_block(
                "a",
                BlockKind::If {
                    variable: "x".into(),
                    operator: crate::flows::CompareOp::Gt,
                    value: crate::flows::Operand::Literal {
                        value: 1.0,
                        unit: None,
                    },
                },
            )
            .with_block("b", BlockKind::Wait { duration_secs: 1 })
            .with_block("end", BlockKind::End)
            .with_connection("start", port::FLOW_OUT, "a")
            .with_connection("a", port::TRUE, "b")
            .with_connection("a", port::FALSE, "end")
            .with_connection("b", port::FLOW_OUT, "end")
    }

    #[test]
    fn build_rejects_dangling_connections() {
        let flow = Flow::new("f", "broken")
            .with_block("start", BlockKind::Start)
            .with_connection("start", port::FLOW_OUT, "ghost");
        let err = FlowGraph::build(&flow).unwrap_err();
        assert_eq!(err, vec!["ghost".to_string()]);
    }

    #[test]
    fn follow_connections_filters_by_port() {
        let graph = FlowGraph::build(&diamond()).unwrap();
        assert_eq!(graph.next_blocks("a", port::TRUE), vec!["b"]);
        assert_eq!(graph.next_blocks("a", port::FALSE), vec!["end"]);
        assert!(graph.next_blocks("a", port::FLOW_OUT).is_empty());
    }

    #[test]
    fn can_reach_follows_direction() {
        let graph = FlowGraph::build(&diamond()).unwrap();
        assert!(graph.can_reach("start", "end"));
        assert!(graph.can_reach("a", "b"));
        assert!(!graph.can_reach("end", "start"));
        assert!(graph.can_reach("b", "b"));
    }

    #[test]
    fn would_create_cycle_iff_target_reaches_source() {
        let graph = FlowGraph::build(&diamond()).unwrap();
        // end → a would close a cycle because a already reaches end.
        assert!(graph.would_create_cycle("end", "a"));
        // a → b exists already and b does not reach a.
        assert!(!graph.would_create_cycle("a", "b"));
    }

    #[test]
    fn traversal_terminates_on_cyclic_graphs() {
        let flow = Flow::new("f", "loop")
            .with_block("start", BlockKind::Start)
            .with_block("x", BlockKind::Wait { duration_secs: 1 })
            .with_block("y", BlockKind::Wait { duration_secs: 1 })
            .with_connection("start", port::FLOW_OUT, "x")
            .with_connection("x", port::FLOW_OUT, "y")
            .with_connection("y", port::FLOW_OUT, "x");
        let graph = FlowGraph::build(&flow).unwrap();

        let reachable = graph.all_reachable("start");
        assert_eq!(reachable.len(), 3);
        assert!(graph.can_reach("x", "y"));
        assert!(graph.can_reach("y", "x"));
        assert!(!graph.can_reach("x", "start"));
    }

    #[test]
    fn terminal_blocks_have_no_outgoing_edges() {
        let graph = FlowGraph::build(&diamond()).unwrap();
        assert_eq!(graph.terminal_blocks(), vec!["end"]);
    }
}
