//! Phylogenetic trees held as an index arena.
//!
//! Supports the handful of operations needed to turn raw tree-builder output
//! into served artifacts: Newick parsing and writing, midpoint rooting,
//! ladderizing and PhyloXML output. All traversals are iterative, so deeply
//! unbalanced trees do not grow the call stack.

use std::fmt::Display;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::config::defs::PipelineError;

const PHYLOXML_NS: &str = "http://www.phyloxml.org";
const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
const PHYLOXML_SCHEMA: &str = "http://www.phyloxml.org http://www.phyloxml.org/1.10/phyloxml.xsd";


#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub name: Option<String>,
    /// Numeric internal-node label, e.g. a FastTree local support value
    pub support: Option<f64>,
    /// Length of the branch leading to this node
    pub length: Option<f64>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    nodes: Vec<Node>,
    root: usize,
}

impl Tree {
    pub fn root(&self) -> &Node {
        &self.nodes[self.root]
    }

    pub fn set_root_name(&mut self, name: &str) {
        self.nodes[self.root].name = Some(name.to_string());
    }

    /// Nodes reachable from the root, parents before children.
    fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(self.nodes[node].children.iter().rev());
        }
        order
    }

    pub fn leaf_names(&self) -> Vec<String> {
        self.preorder()
            .into_iter()
            .filter(|&n| self.nodes[n].children.is_empty())
            .map(|n| self.nodes[n].name.clone().unwrap_or_default())
            .collect()
    }

    /// Number of terminals below every node, indexed by arena position.
    fn terminal_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.nodes.len()];
        for &node in self.preorder().iter().rev() {
            let children = &self.nodes[node].children;
            counts[node] = if children.is_empty() {
                1
            } else {
                children.iter().map(|&c| counts[c]).sum()
            };
        }
        counts
    }

    /// Sorts every node's children by ascending terminal count. The sort is
    /// stable, so equal-sized clades keep their relative order.
    pub fn ladderize(&mut self) {
        let counts = self.terminal_counts();
        for node in self.preorder() {
            self.nodes[node].children.sort_by_key(|&c| counts[c]);
        }
    }

    fn neighbors(&self, node: usize) -> Vec<(usize, f64)> {
        let n = &self.nodes[node];
        let mut out: Vec<(usize, f64)> = n
            .children
            .iter()
            .map(|&c| (c, self.nodes[c].length.unwrap_or(0.0)))
            .collect();
        if let Some(parent) = n.parent {
            out.push((parent, n.length.unwrap_or(0.0)));
        }
        out
    }

    /// Farthest terminal from `start`, with the distance to it and the
    /// predecessor of every visited node on the way.
    fn farthest_terminal(&self, start: usize) -> (usize, f64, Vec<Option<usize>>) {
        let mut dist = vec![0.0; self.nodes.len()];
        let mut visited = vec![false; self.nodes.len()];
        let mut prev = vec![None; self.nodes.len()];
        let mut best = (start, 0.0);
        visited[start] = true;
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if self.nodes[node].children.is_empty() && dist[node] > best.1 {
                best = (node, dist[node]);
            }
            for (next, weight) in self.neighbors(node) {
                if !visited[next] {
                    visited[next] = true;
                    dist[next] = dist[node] + weight;
                    prev[next] = Some(node);
                    stack.push(next);
                }
            }
        }
        (best.0, best.1, prev)
    }

    fn first_terminal(&self) -> usize {
        let mut node = self.root;
        while let Some(&child) = self.nodes[node].children.first() {
            node = child;
        }
        node
    }

    /// Re-roots the tree at the midpoint of its longest tip-to-tip path.
    ///
    /// If the midpoint falls on an existing internal node (within rounding of
    /// the written branch lengths) that node becomes the root; otherwise the
    /// branch holding the midpoint is split. An old root left with a single
    /// child is removed and its two branches merged.
    pub fn root_at_midpoint(&mut self) {
        let (a, _, _) = self.farthest_terminal(self.first_terminal());
        let (b, diameter, prev) = self.farthest_terminal(a);
        if b == a || diameter <= 0.0 {
            return;
        }

        // Path from a to b, with cumulative distances from a.
        let mut path = vec![b];
        while let Some(p) = prev[*path.last().unwrap_or(&a)] {
            path.push(p);
        }
        path.reverse();
        let mut cumulative = vec![0.0; path.len()];
        for i in 1..path.len() {
            let weight = self
                .neighbors(path[i - 1])
                .into_iter()
                .find(|&(n, _)| n == path[i])
                .map(|(_, w)| w)
                .unwrap_or(0.0);
            cumulative[i] = cumulative[i - 1] + weight;
        }

        let half = diameter / 2.0;
        let eps = 1e-5 * path.len() as f64;
        if diameter <= 2.0 * eps {
            return;
        }
        let i = cumulative.iter().position(|&d| d >= half - eps).unwrap_or(path.len() - 1).max(1);

        let snapped = path[i];
        if (cumulative[i] - half).abs() <= eps && !self.nodes[snapped].children.is_empty() {
            self.reroot_at(snapped);
            return;
        }

        let (u, v) = (path[i - 1], path[i]);
        let offset = (half - cumulative[i - 1]).clamp(0.0, cumulative[i] - cumulative[i - 1]);
        let new_root = self.split_branch(u, v, offset);
        self.reroot_at(new_root);
    }

    /// Inserts a node on the branch between adjacent nodes `u` and `v`,
    /// `offset_from_u` along it.
    fn split_branch(&mut self, u: usize, v: usize, offset_from_u: f64) -> usize {
        let (parent, child, offset_from_parent) = if self.nodes[v].parent == Some(u) {
            (u, v, offset_from_u)
        } else {
            let length = self.nodes[u].length.unwrap_or(0.0);
            (v, u, length - offset_from_u)
        };
        let length = self.nodes[child].length.unwrap_or(0.0);
        let new_node = self.nodes.len();
        self.nodes.push(Node {
            length: Some(offset_from_parent),
            parent: Some(parent),
            children: vec![child],
            ..Node::default()
        });
        if let Some(slot) = self.nodes[parent].children.iter_mut().find(|c| **c == child) {
            *slot = new_node;
        }
        self.nodes[child].parent = Some(new_node);
        self.nodes[child].length = Some(length - offset_from_parent);
        new_node
    }

    fn reroot_at(&mut self, new_root: usize) {
        if new_root == self.root {
            return;
        }
        let old_root = self.root;

        let mut path = vec![new_root];
        while let Some(parent) = self.nodes[*path.last().unwrap_or(&new_root)].parent {
            path.push(parent);
        }
        let lengths: Vec<Option<f64>> = path.iter().map(|&n| self.nodes[n].length).collect();

        for i in 0..path.len() - 1 {
            let (child, parent) = (path[i], path[i + 1]);
            self.nodes[parent].children.retain(|&c| c != child);
            self.nodes[child].children.push(parent);
            self.nodes[parent].parent = Some(child);
            self.nodes[parent].length = lengths[i];
        }
        self.nodes[new_root].parent = None;
        self.nodes[new_root].length = None;
        self.root = new_root;

        // Drop the old root if it is now just a pass-through node.
        if self.nodes[old_root].children.len() == 1 {
            let child = self.nodes[old_root].children[0];
            if let Some(parent) = self.nodes[old_root].parent {
                let merged = match (self.nodes[old_root].length, self.nodes[child].length) {
                    (None, None) => None,
                    (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
                };
                self.nodes[child].length = merged;
                self.nodes[child].parent = Some(parent);
                if let Some(slot) = self.nodes[parent].children.iter_mut().find(|c| **c == old_root) {
                    *slot = child;
                }
                self.nodes[old_root].children.clear();
                self.nodes[old_root].parent = None;
            }
        }
    }


    /// Parses a single Newick tree.
    pub fn from_newick(text: &str) -> Result<Tree, PipelineError> {
        let chars: Vec<char> = text.chars().collect();
        let mut nodes: Vec<Node> = Vec::new();
        let mut open: Vec<usize> = Vec::new();
        let mut last: Option<usize> = None;
        let mut expect_node = true;
        let mut finished = false;
        let mut pos = 0;

        let invalid = |msg: &str, at: usize| PipelineError::InvalidInput(format!("Newick: {} at character {}", msg, at));

        fn add_node(nodes: &mut Vec<Node>, parent: Option<usize>) -> usize {
            let index = nodes.len();
            nodes.push(Node { parent, ..Node::default() });
            if let Some(p) = parent {
                nodes[p].children.push(index);
            }
            index
        }

        while pos < chars.len() && !finished {
            let c = chars[pos];
            match c {
                c if c.is_whitespace() => pos += 1,
                '[' => {
                    while pos < chars.len() && chars[pos] != ']' {
                        pos += 1;
                    }
                    if pos == chars.len() {
                        return Err(invalid("unterminated comment", pos));
                    }
                    pos += 1;
                }
                '(' => {
                    if !expect_node || (open.is_empty() && !nodes.is_empty()) {
                        return Err(invalid("unexpected '('", pos));
                    }
                    let node = add_node(&mut nodes, open.last().copied());
                    open.push(node);
                    last = None;
                    expect_node = true;
                    pos += 1;
                }
                ',' | ')' => {
                    if open.is_empty() {
                        return Err(invalid("unbalanced parentheses", pos));
                    }
                    if expect_node {
                        add_node(&mut nodes, open.last().copied());
                    }
                    if c == ')' {
                        last = open.pop();
                        expect_node = false;
                    } else {
                        last = None;
                        expect_node = true;
                    }
                    pos += 1;
                }
                ':' => {
                    pos += 1;
                    let start = pos;
                    while pos < chars.len() && !"(),:;[".contains(chars[pos]) && !chars[pos].is_whitespace() {
                        pos += 1;
                    }
                    let number: String = chars[start..pos].iter().collect();
                    let length: f64 = number.parse().map_err(|_| invalid("bad branch length", start))?;
                    if !length.is_finite() {
                        return Err(invalid("bad branch length", start));
                    }
                    let target = match last {
                        Some(node) => node,
                        None if expect_node => {
                            let node = add_node(&mut nodes, open.last().copied());
                            expect_node = false;
                            last = Some(node);
                            node
                        }
                        None => return Err(invalid("branch length without node", start)),
                    };
                    nodes[target].length = Some(length);
                }
                ';' => {
                    if !open.is_empty() {
                        return Err(invalid("unbalanced parentheses", pos));
                    }
                    finished = true;
                }
                _ => {
                    let (label, next) = read_label(&chars, pos).map_err(|msg| invalid(msg, pos))?;
                    pos = next;
                    match last {
                        Some(node) if !nodes[node].children.is_empty() && nodes[node].name.is_none() && nodes[node].support.is_none() => {
                            match label.parse::<f64>() {
                                Ok(support) => nodes[node].support = Some(support),
                                Err(_) => nodes[node].name = Some(label),
                            }
                        }
                        None if expect_node => {
                            if open.is_empty() && !nodes.is_empty() {
                                return Err(invalid("text after tree", pos));
                            }
                            let node = add_node(&mut nodes, open.last().copied());
                            nodes[node].name = Some(label);
                            last = Some(node);
                            expect_node = false;
                        }
                        _ => return Err(invalid("unexpected label", pos)),
                    }
                }
            }
        }

        if !open.is_empty() {
            return Err(invalid("unbalanced parentheses", pos));
        }
        if nodes.is_empty() {
            return Err(PipelineError::InvalidInput("Newick: empty tree".to_string()));
        }
        Ok(Tree { nodes, root: 0 })
    }

    pub fn to_newick(&self) -> String {
        let mut out = String::new();
        let mut stack: Vec<(usize, usize)> = vec![(self.root, 0)];
        while let Some((node, child_idx)) = stack.pop() {
            let children = &self.nodes[node].children;
            if !children.is_empty() && child_idx < children.len() {
                out.push(if child_idx == 0 { '(' } else { ',' });
                stack.push((node, child_idx + 1));
                stack.push((children[child_idx], 0));
                continue;
            }
            if !children.is_empty() {
                out.push(')');
            }
            self.write_label(node, &mut out);
        }
        out.push_str(";\n");
        out
    }

    fn write_label(&self, node: usize, out: &mut String) {
        let n = &self.nodes[node];
        match (&n.name, n.support) {
            (Some(name), _) => out.push_str(&quote_label(name)),
            (None, Some(support)) => out.push_str(&format!("{}", support)),
            (None, None) => {}
        }
        if let Some(length) = n.length {
            out.push_str(&format!(":{:.5}", length));
        }
    }

    pub fn to_phyloxml(&self) -> Result<String, PipelineError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;
        writer
            .write_event(Event::Start(BytesStart::new("phyloxml").with_attributes([
                ("xmlns:xsi", XSI_NS),
                ("xmlns", PHYLOXML_NS),
                ("xsi:schemaLocation", PHYLOXML_SCHEMA),
            ])))
            .map_err(xml_err)?;
        writer
            .write_event(Event::Start(BytesStart::new("phylogeny").with_attributes([("rooted", "true")])))
            .map_err(xml_err)?;

        let mut stack: Vec<(usize, usize)> = vec![(self.root, 0)];
        while let Some((node, child_idx)) = stack.pop() {
            let n = &self.nodes[node];
            if child_idx == 0 {
                writer.write_event(Event::Start(BytesStart::new("clade"))).map_err(xml_err)?;
                if let Some(name) = &n.name {
                    write_text_element(&mut writer, "name", name)?;
                }
                if let Some(length) = n.length {
                    write_text_element(&mut writer, "branch_length", &format!("{}", length))?;
                }
                if let Some(support) = n.support {
                    writer
                        .write_event(Event::Start(BytesStart::new("confidence").with_attributes([("type", "unknown")])))
                        .map_err(xml_err)?;
                    writer
                        .write_event(Event::Text(BytesText::new(&format!("{}", support))))
                        .map_err(xml_err)?;
                    writer.write_event(Event::End(BytesEnd::new("confidence"))).map_err(xml_err)?;
                }
            }
            if child_idx < n.children.len() {
                stack.push((node, child_idx + 1));
                stack.push((n.children[child_idx], 0));
            } else {
                writer.write_event(Event::End(BytesEnd::new("clade"))).map_err(xml_err)?;
            }
        }

        writer.write_event(Event::End(BytesEnd::new("phylogeny"))).map_err(xml_err)?;
        writer.write_event(Event::End(BytesEnd::new("phyloxml"))).map_err(xml_err)?;
        let mut xml = String::from_utf8(writer.into_inner()).map_err(xml_err)?;
        xml.push('\n');
        Ok(xml)
    }
}

fn xml_err<E: Display>(e: E) -> PipelineError {
    PipelineError::IOError(format!("PhyloXML: {}", e))
}

fn write_text_element(writer: &mut Writer<Vec<u8>>, tag: &str, text: &str) -> Result<(), PipelineError> {
    writer.write_event(Event::Start(BytesStart::new(tag))).map_err(xml_err)?;
    writer.write_event(Event::Text(BytesText::new(text))).map_err(xml_err)?;
    writer.write_event(Event::End(BytesEnd::new(tag))).map_err(xml_err)?;
    Ok(())
}

/// Reads a quoted or unquoted label starting at `pos`.
fn read_label(chars: &[char], mut pos: usize) -> Result<(String, usize), &'static str> {
    let mut label = String::new();
    if chars[pos] == '\'' {
        pos += 1;
        loop {
            match chars.get(pos) {
                None => return Err("unterminated quoted label"),
                Some('\'') if chars.get(pos + 1) == Some(&'\'') => {
                    label.push('\'');
                    pos += 2;
                }
                Some('\'') => {
                    pos += 1;
                    break;
                }
                Some(&c) => {
                    label.push(c);
                    pos += 1;
                }
            }
        }
    } else {
        while pos < chars.len() && !"(),:;[".contains(chars[pos]) && !chars[pos].is_whitespace() {
            // Unquoted underscores stand for blanks.
            label.push(if chars[pos] == '_' { ' ' } else { chars[pos] });
            pos += 1;
        }
    }
    Ok((label, pos))
}

fn quote_label(label: &str) -> String {
    let needs_quotes = label.chars().any(|c| "(),:;[]'_".contains(c) || c.is_whitespace());
    if !needs_quotes {
        return label.to_string();
    }
    if !label.chars().any(|c| "(),:;[]'_\t\n\r".contains(c)) {
        return label.replace(' ', "_");
    }
    format!("'{}'", label.replace('\'', "''"))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_write_roundtrip_shape() -> anyhow::Result<()> {
        let tree = Tree::from_newick("((A:1,B:2)0.95:0.5,C:3);")?;
        assert_eq!(tree.leaf_names(), vec!["A", "B", "C"]);
        assert_eq!(tree.to_newick(), "((A:1.00000,B:2.00000)0.95:0.50000,C:3.00000);\n");
        Ok(())
    }

    #[test]
    fn test_parse_edge_cases() -> anyhow::Result<()> {
        let tree = Tree::from_newick("[comment]('Homo sapiens''s':1,Pan_troglodytes, ):0;")?;
        assert_eq!(tree.leaf_names(), vec!["Homo sapiens's", "Pan troglodytes", ""]);
        assert_eq!(tree.root().length, Some(0.0));
        assert!(Tree::from_newick("((A,B);").is_err());
        assert!(Tree::from_newick("(A,B));").is_err());
        assert!(Tree::from_newick("(A:x,B);").is_err());
        assert!(Tree::from_newick("").is_err());
        Ok(())
    }

    #[test]
    fn test_non_finite_branch_lengths_rejected() {
        for text in ["((A:1,B:1):nan,C:1);", "(A:inf,B:1);", "(A:-Infinity,B:1);", "(A:NaN,B:1);"] {
            assert!(matches!(Tree::from_newick(text), Err(PipelineError::InvalidInput(_))), "{}", text);
        }
    }

    #[test]
    fn test_midpoint_root_terminates_with_zero_and_negative_lengths() -> anyhow::Result<()> {
        let mut tree = Tree::from_newick("((A:0,B:0):0,(C:-1,D:3):0);")?;
        tree.root_at_midpoint();
        assert_eq!(tree.leaf_names().len(), 4);
        Ok(())
    }

    #[test]
    fn test_ladderize_sorts_by_terminal_count() -> anyhow::Result<()> {
        let mut tree = Tree::from_newick("(((A,B),C),D);")?;
        tree.ladderize();
        assert_eq!(tree.to_newick(), "(D,(C,(A,B)));\n");
        Ok(())
    }

    #[test]
    fn test_midpoint_root_splits_longest_path() -> anyhow::Result<()> {
        // Longest path A..D is 1 + 1 + 10 = 12, midpoint 6 along D's branch.
        let mut tree = Tree::from_newick("((A:1,B:1):1,(C:1,D:10):0);")?;
        tree.root_at_midpoint();
        tree.ladderize();
        tree.set_root_name("legA");
        assert_eq!(tree.to_newick(), "(D:6.00000,(C:1.00000,(A:1.00000,B:1.00000):1.00000):4.00000)legA;\n");
        Ok(())
    }

    #[test]
    fn test_midpoint_root_is_stable_on_rooted_output() -> anyhow::Result<()> {
        let mut first = Tree::from_newick("(A:0.1,(B:0.2,(C:0.3,D:0.45)0.9:0.05)0.8:0.07,E:0.8);")?;
        first.root_at_midpoint();
        first.ladderize();
        first.set_root_name("fam");
        let once = first.to_newick();

        let mut second = Tree::from_newick(&once)?;
        second.root_at_midpoint();
        second.ladderize();
        second.set_root_name("fam");
        assert_eq!(second.to_newick(), once);
        Ok(())
    }

    #[test]
    fn test_phyloxml_output() -> anyhow::Result<()> {
        let mut tree = Tree::from_newick("(A&B:1,(C:1,D:1)0.7:2);")?;
        tree.set_root_name("root");
        let xml = tree.to_phyloxml()?;
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<phylogeny rooted=\"true\">"));
        assert!(xml.contains("<name>A&amp;B</name>"));
        assert!(xml.contains("<confidence type=\"unknown\">0.7</confidence>"));
        assert_eq!(xml.matches("<clade>").count(), 5);
        assert_eq!(xml.matches("</clade>").count(), 5);
        Ok(())
    }
}
