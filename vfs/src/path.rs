//! 路径处理，只做字面上的规范化，不跟随符号链接

use alloc::{string::String, vec::Vec};

/// 规范化绝对路径：去掉空分量与 `.`，`..` 弹出上一分量，根之上的 `..` 停在根。
/// 相对路径视作从根开始。
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }

    if parts.is_empty() {
        return String::from("/");
    }
    let mut normal = String::with_capacity(path.len());
    for part in parts {
        normal.push('/');
        normal.push_str(part);
    }
    normal
}

/// 分成父目录与最后一个分量，参数须已规范化；根没有最后分量
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    let pos = path.rfind('/')?;
    let name = &path[pos + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if pos == 0 { "/" } else { &path[..pos] };

    Some((parent, name))
}

/// `point` 是否为 `path` 在分量边界上的前缀，两者均须已规范化
pub fn is_prefix(point: &str, path: &str) -> bool {
    point == "/"
        || path == point
        || (path.starts_with(point) && path.as_bytes().get(point.len()) == Some(&b'/'))
}

/// `path` 去掉挂载点前缀后的分量
pub fn components<'a>(point: &str, path: &'a str) -> impl Iterator<Item = &'a str> {
    let rest = if point == "/" {
        path
    } else {
        &path[point.len()..]
    };
    rest.split('/').filter(|part| !part.is_empty())
}
