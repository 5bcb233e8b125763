// Copyright 2021 Karl Sundequist Blomdahl <karl.sundequist.blomdahl@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use pz_games::GameState;
use pz_tensor::Tensor;

/// An `f32` updated with compare-and-swap loops, stored as its bit
/// pattern.
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    pub fn fetch_add(&self, delta: f32) {
        let mut current = self.0.load(Ordering::Acquire);

        loop {
            let next = (f32::from_bits(current) + delta).to_bits();

            match self.0.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual
            }
        }
    }
}

/// Accumulated statistics of a node, updated without per-node locking.
pub struct MctsStats {
    value: AtomicF32,
    num_visit: AtomicI32,
    virtual_loss: AtomicF32,
    sum_child_v: AtomicF32,
    num_child: AtomicI32
}

impl MctsStats {
    pub fn new() -> Self {
        Self {
            value: AtomicF32::new(0.0),
            num_visit: AtomicI32::new(0),
            virtual_loss: AtomicF32::new(0.0),
            sum_child_v: AtomicF32::new(0.0),
            num_child: AtomicI32::new(0)
        }
    }

    pub fn value(&self) -> f32 {
        self.value.load()
    }

    pub fn num_visit(&self) -> i32 {
        self.num_visit.load(Ordering::Acquire)
    }

    pub fn virtual_loss(&self) -> f32 {
        self.virtual_loss.load()
    }

    /// The average value of the explored children, used as the initial
    /// estimate for their unvisited siblings.
    pub fn avg_child_v(&self) -> f32 {
        let num_child = self.num_child.load(Ordering::Acquire);

        if num_child == 0 {
            0.0
        } else {
            self.sum_child_v.load() / num_child as f32
        }
    }

    pub fn avg_value(&self) -> f32 {
        let num_visit = self.num_visit();

        if num_visit == 0 {
            0.0
        } else {
            self.value.load() / num_visit as f32
        }
    }

    pub fn add_virtual_loss(&self, virtual_loss: f32) {
        self.virtual_loss.fetch_add(virtual_loss);
    }

    /// Record one completed rollout through this node: accumulate the
    /// signed value, count the visit, and take back the virtual loss added
    /// during selection.
    pub fn atomic_update(&self, value: f32, virtual_loss: f32) {
        self.value.fetch_add(value);
        self.num_visit.fetch_add(1, Ordering::AcqRel);
        self.virtual_loss.fetch_add(-virtual_loss);
    }

    pub fn atomic_update_child_v(&self, child_v: f32) {
        self.sum_child_v.fetch_add(child_v);
        self.num_child.fetch_add(1, Ordering::AcqRel);
    }
}

pub type NodeId = u32;

/// A search tree node. Structure fields (`children`, `state`, `player`)
/// are written by the single worker that owns the tree during a phase;
/// only `stats` is shared.
pub struct Node {
    pub parent: Option<NodeId>,

    /// Index of the action (in the parent state's legal-actions list) that
    /// leads to this node.
    pub action: i64,

    /// The player to move at this node; meaningful once evaluated.
    pub player: usize,

    pub depth: u32,
    pub prior: f32,
    pub stats: MctsStats,
    pub children: Vec<NodeId>,
    pub expanded: bool,
    pub terminal: bool,

    /// Reward at a terminal node, from the perspective of the player who
    /// chose it.
    pub terminal_value: f32,

    /// Selected for evaluation in the current wave.
    pub pending: bool,

    /// Present at the root and at depths that are multiples of the
    /// store-state interval; recomputed by replay otherwise.
    pub state: Option<Box<dyn GameState>>,

    /// Recurrent state produced when this node was evaluated.
    pub rnn_state: Option<Tensor>
}

impl Node {
    pub fn new(parent: Option<NodeId>, action: i64, depth: u32, prior: f32) -> Self {
        Self {
            parent,
            action,
            player: 0,
            depth,
            prior,
            stats: MctsStats::new(),
            children: Vec::new(),
            expanded: false,
            terminal: false,
            terminal_value: 0.0,
            pending: false,
            state: None,
            rnn_state: None
        }
    }
}

/// Arena of tree nodes addressed by integer handles, so parent links are
/// back-handles instead of owning pointers.
pub struct Storage {
    nodes: Vec<Node>
}

impl Storage {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn alloc(&mut self, node: Node) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A search tree kept alive between moves so that the subtree below the
/// played action seeds the next search. Owns its storage; dropping the
/// tree frees every node at once.
pub struct PersistentTree {
    pub storage: Storage,
    pub root: Option<NodeId>
}

impl PersistentTree {
    pub fn new() -> Self {
        Self {
            storage: Storage::new(),
            root: None
        }
    }

    /// Move the root to the child reached by the given action. If that
    /// child does not exist (or there is no root), the tree is cleared and
    /// the next search starts fresh.
    ///
    /// # Arguments
    ///
    /// * `action` - index of the played action in the legal-actions list
    ///
    pub fn descend(&mut self, action: i64) {
        let next = self.root.and_then(|root| {
            self.storage.node(root).children.iter()
                .cloned()
                .find(|&child| self.storage.node(child).action == action)
        });

        match next {
            Some(child) => {
                self.storage.node_mut(child).parent = None;
                self.root = Some(child);
            },
            None => self.clear()
        }
    }

    pub fn clear(&mut self) {
        self.storage = Storage::new();
        self.root = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn atomic_f32_accumulates() {
        let value = Arc::new(AtomicF32::new(0.0));
        let handles = (0..4).map(|_| {
            let value = value.clone();

            thread::spawn(move || {
                for _ in 0..1000 {
                    value.fetch_add(1.0);
                }
            })
        }).collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(value.load(), 4000.0);
    }

    #[test]
    fn stats_update() {
        let stats = MctsStats::new();

        stats.add_virtual_loss(1.0);
        assert_eq!(stats.virtual_loss(), 1.0);

        stats.atomic_update(0.5, 1.0);
        assert_eq!(stats.num_visit(), 1);
        assert_eq!(stats.value(), 0.5);
        assert_eq!(stats.virtual_loss(), 0.0);

        stats.atomic_update_child_v(0.25);
        stats.atomic_update_child_v(0.75);
        assert_eq!(stats.avg_child_v(), 0.5);
    }

    #[test]
    fn descend_moves_root() {
        let mut tree = PersistentTree::new();
        let root = tree.storage.alloc(Node::new(None, -1, 0, 1.0));
        let child_a = tree.storage.alloc(Node::new(Some(root), 0, 1, 0.5));
        let child_b = tree.storage.alloc(Node::new(Some(root), 1, 1, 0.5));
        tree.storage.node_mut(root).children = vec! [child_a, child_b];
        tree.storage.node_mut(root).expanded = true;
        tree.root = Some(root);

        tree.descend(1);
        assert_eq!(tree.root, Some(child_b));
        assert!(tree.storage.node(child_b).parent.is_none());

        tree.descend(42);
        assert!(tree.root.is_none());
        assert!(tree.storage.is_empty());
    }
}
