//! 把路径集合格式化为目录树，用于日志输出

use std::collections::BTreeMap;

#[derive(Default)]
struct Node {
    children: BTreeMap<String, Node>,
}

/// 格式化文件树
///
/// ```text
/// Modified files:
/// ├── main.py
/// └── screens
///     └── a.py
/// ```
pub fn format_file_tree<I, S>(paths: I, title: &str) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut root = Node::default();
    let mut count = 0usize;

    for path in paths {
        count += 1;
        let mut node = &mut root;
        for part in path.as_ref().split('/').filter(|p| !p.is_empty()) {
            node = node.children.entry(part.to_string()).or_default();
        }
    }

    if count == 0 {
        return format!("{}: (empty)", title);
    }

    let mut lines = vec![format!("{}:", title)];
    render(&root, "", &mut lines);
    lines.join("\n")
}

fn render(node: &Node, prefix: &str, lines: &mut Vec<String>) {
    let total = node.children.len();
    for (i, (name, child)) in node.children.iter().enumerate() {
        let is_last = i + 1 == total;
        let connector = if is_last { "└── " } else { "├── " };
        lines.push(format!("{}{}{}", prefix, connector, name));

        if !child.children.is_empty() {
            let next = format!("{}{}", prefix, if is_last { "    " } else { "│   " });
            render(child, &next, lines);
        }
    }
}
