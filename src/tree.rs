//! Document tree schema.
//!
//! A directory document holds an ordered list `docs` of child entries
//! `{name, kind, url}`; a file document holds `{name, extension,
//! mimeType, content, metadata}`. Text content is a collaborative text
//! object, binary content a bytes scalar. Names are unique within a
//! directory; the tree is strict (children only, no back-references).

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

use automerge::transaction::Transactable;
use automerge::{Automerge, ChangeHash, ObjId, ObjType, ReadDoc, ScalarValue, Value, ROOT};

use crate::hash::{hash_bytes, ContentHash};
use crate::store::{DocId, DocStore, StoreError};

const F_DOCS: &str = "docs";
const F_NAME: &str = "name";
const F_KIND: &str = "kind";
const F_URL: &str = "url";
const F_EXTENSION: &str = "extension";
const F_MIME: &str = "mimeType";
const F_CONTENT: &str = "content";
const F_METADATA: &str = "metadata";
const F_PERMISSIONS: &str = "permissions";

const KIND_FILE: &str = "file";
const KIND_FOLDER: &str = "folder";

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    File,
    Folder,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::File => KIND_FILE,
            EntryKind::Folder => KIND_FOLDER,
        }
    }
}

impl FromStr for EntryKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            KIND_FILE => Ok(EntryKind::File),
            KIND_FOLDER => Ok(EntryKind::Folder),
            other => Err(StoreError::Schema(format!("unknown entry kind: {other}"))),
        }
    }
}

/// One `docs` list entry of a directory document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub name: String,
    pub kind: EntryKind,
    pub id: DocId,
}

/// File content as stored in a file document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    pub fn is_text(&self) -> bool {
        matches!(self, FileContent::Text(_))
    }

    pub fn len(&self) -> usize {
        match self {
            FileContent::Text(s) => s.len(),
            FileContent::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FileContent::Text(s) => s.as_bytes(),
            FileContent::Binary(b) => b,
        }
    }

    pub fn hash(&self) -> ContentHash {
        hash_bytes(self.as_bytes())
    }
}

/// Metadata for creating or renaming a file document.
#[derive(Debug, Clone)]
pub struct FileAttrs {
    pub name: String,
    pub extension: String,
    pub mime_type: String,
    pub permissions: Option<u32>,
}

fn transact<F>(doc: &mut Automerge, f: F) -> Result<(), StoreError>
where
    F: FnOnce(&mut automerge::transaction::Transaction<'_>) -> Result<(), automerge::AutomergeError>,
{
    doc.transact::<_, _, automerge::AutomergeError>(f)
        .map_err(|e| StoreError::Automerge(format!("{e:?}")))?;
    Ok(())
}

fn as_str(value: &Value<'_>) -> Option<String> {
    match value {
        Value::Scalar(s) => match s.as_ref() {
            ScalarValue::Str(s) => Some(s.to_string()),
            _ => None,
        },
        _ => None,
    }
}

fn as_uint(value: &Value<'_>) -> Option<u64> {
    match value {
        Value::Scalar(s) => match s.as_ref() {
            ScalarValue::Uint(u) => Some(*u),
            ScalarValue::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        },
        _ => None,
    }
}

// ---- directory documents ----

/// Initialize an empty directory document.
pub fn init_directory(doc: &mut Automerge) -> Result<(), StoreError> {
    transact(doc, |tx| {
        tx.put_object(ROOT, F_DOCS, ObjType::List)?;
        Ok(())
    })
}

fn docs_list(doc: &Automerge) -> Result<ObjId, StoreError> {
    match doc.get(ROOT, F_DOCS)? {
        Some((Value::Object(ObjType::List), id)) => Ok(id),
        _ => Err(StoreError::Schema("directory document has no docs list".into())),
    }
}

fn child_at_index(doc: &Automerge, list: &ObjId, i: usize) -> Result<ChildEntry, StoreError> {
    let (_, entry) = doc
        .get(list, i)?
        .ok_or_else(|| StoreError::Schema(format!("missing docs entry {i}")))?;

    let field = |name: &str| -> Result<String, StoreError> {
        doc.get(&entry, name)?
            .and_then(|(v, _)| as_str(&v))
            .ok_or_else(|| StoreError::Schema(format!("docs entry missing {name}")))
    };

    Ok(ChildEntry {
        name: field(F_NAME)?,
        kind: field(F_KIND)?.parse()?,
        id: field(F_URL)?
            .parse()
            .map_err(|_| StoreError::Schema("docs entry has invalid url".into()))?,
    })
}

/// Children of a directory document at its current state.
pub fn dir_children(doc: &Automerge) -> Result<Vec<ChildEntry>, StoreError> {
    let list = docs_list(doc)?;
    let len = doc.length(&list);
    (0..len).map(|i| child_at_index(doc, &list, i)).collect()
}

/// Children of a directory document as of `heads`.
pub fn dir_children_at(
    doc: &Automerge,
    heads: &[ChangeHash],
) -> Result<Vec<ChildEntry>, StoreError> {
    let list = match doc.get_at(ROOT, F_DOCS, heads)? {
        Some((Value::Object(ObjType::List), id)) => id,
        _ => return Err(StoreError::Schema("directory document has no docs list".into())),
    };
    let len = doc.length_at(&list, heads);
    (0..len)
        .map(|i| {
            let (_, entry) = doc
                .get_at(&list, i, heads)?
                .ok_or_else(|| StoreError::Schema(format!("missing docs entry {i}")))?;
            let field = |name: &str| -> Result<String, StoreError> {
                doc.get_at(&entry, name, heads)?
                    .and_then(|(v, _)| as_str(&v))
                    .ok_or_else(|| StoreError::Schema(format!("docs entry missing {name}")))
            };
            Ok(ChildEntry {
                name: field(F_NAME)?,
                kind: field(F_KIND)?.parse()?,
                id: field(F_URL)?
                    .parse()
                    .map_err(|_| StoreError::Schema("docs entry has invalid url".into()))?,
            })
        })
        .collect()
}

fn find_index(doc: &Automerge, list: &ObjId, name: &str) -> Result<Option<usize>, StoreError> {
    let len = doc.length(list);
    for i in 0..len {
        if child_at_index(doc, list, i)?.name == name {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

/// Append a child entry. A duplicate name is an invariant violation.
pub fn add_child(
    doc: &mut Automerge,
    name: &str,
    kind: EntryKind,
    id: &DocId,
) -> Result<(), StoreError> {
    let list = docs_list(doc)?;
    if find_index(doc, &list, name)?.is_some() {
        return Err(StoreError::NameCollision(name.to_string()));
    }
    let idx = doc.length(&list);
    let id_str = id.to_string();
    transact(doc, |tx| {
        let entry = tx.insert_object(&list, idx, ObjType::Map)?;
        tx.put(&entry, F_NAME, name)?;
        tx.put(&entry, F_KIND, kind.as_str())?;
        tx.put(&entry, F_URL, id_str.as_str())?;
        Ok(())
    })
}

/// Remove a child entry by name. Returns whether an entry was removed.
pub fn remove_child(doc: &mut Automerge, name: &str) -> Result<bool, StoreError> {
    let list = docs_list(doc)?;
    match find_index(doc, &list, name)? {
        Some(idx) => {
            transact(doc, |tx| {
                tx.delete(&list, idx)?;
                Ok(())
            })?;
            Ok(true)
        },
        None => Ok(false),
    }
}

/// Rename a child in place, preserving its document id and list position.
pub fn rename_child(doc: &mut Automerge, old: &str, new: &str) -> Result<(), StoreError> {
    let list = docs_list(doc)?;
    if find_index(doc, &list, new)?.is_some() {
        return Err(StoreError::NameCollision(new.to_string()));
    }
    let idx = find_index(doc, &list, old)?
        .ok_or_else(|| StoreError::Schema(format!("no child named {old}")))?;
    let (_, entry) = doc
        .get(&list, idx)?
        .ok_or_else(|| StoreError::Schema(format!("missing docs entry {idx}")))?;
    transact(doc, |tx| {
        tx.put(&entry, F_NAME, new)?;
        Ok(())
    })
}

/// Point an existing child at a different document, updating its kind
/// (type change: the old document is orphaned, a new one takes over).
pub fn replace_child(
    doc: &mut Automerge,
    name: &str,
    kind: EntryKind,
    id: &DocId,
) -> Result<(), StoreError> {
    let list = docs_list(doc)?;
    let idx = find_index(doc, &list, name)?
        .ok_or_else(|| StoreError::Schema(format!("no child named {name}")))?;
    let (_, entry) = doc
        .get(&list, idx)?
        .ok_or_else(|| StoreError::Schema(format!("missing docs entry {idx}")))?;
    let id_str = id.to_string();
    transact(doc, |tx| {
        tx.put(&entry, F_KIND, kind.as_str())?;
        tx.put(&entry, F_URL, id_str.as_str())?;
        Ok(())
    })
}

// ---- file documents ----

/// Initialize a file document with attributes and content.
pub fn init_file(
    doc: &mut Automerge,
    attrs: &FileAttrs,
    content: &FileContent,
) -> Result<(), StoreError> {
    transact(doc, |tx| {
        tx.put(ROOT, F_NAME, attrs.name.as_str())?;
        tx.put(ROOT, F_EXTENSION, attrs.extension.as_str())?;
        tx.put(ROOT, F_MIME, attrs.mime_type.as_str())?;
        let meta = tx.put_object(ROOT, F_METADATA, ObjType::Map)?;
        if let Some(mode) = attrs.permissions {
            tx.put(&meta, F_PERMISSIONS, ScalarValue::Uint(mode as u64))?;
        }
        match content {
            FileContent::Text(text) => {
                let obj = tx.put_object(ROOT, F_CONTENT, ObjType::Text)?;
                tx.splice_text(&obj, 0, 0, text)?;
            },
            FileContent::Binary(bytes) => {
                tx.put(ROOT, F_CONTENT, ScalarValue::Bytes(bytes.clone()))?;
            },
        }
        Ok(())
    })
}

/// Read file content at the current state.
pub fn file_content(doc: &Automerge) -> Result<FileContent, StoreError> {
    match doc.get(ROOT, F_CONTENT)? {
        Some((Value::Object(ObjType::Text), obj)) => Ok(FileContent::Text(doc.text(&obj)?)),
        Some((Value::Scalar(s), _)) => match s.as_ref() {
            ScalarValue::Bytes(b) => Ok(FileContent::Binary(b.clone())),
            _ => Err(StoreError::Schema("file content is not text or bytes".into())),
        },
        _ => Err(StoreError::Schema("file document has no content".into())),
    }
}

/// Read file content as of `heads`.
pub fn file_content_at(
    doc: &Automerge,
    heads: &[ChangeHash],
) -> Result<FileContent, StoreError> {
    match doc.get_at(ROOT, F_CONTENT, heads)? {
        Some((Value::Object(ObjType::Text), obj)) => {
            Ok(FileContent::Text(doc.text_at(&obj, heads)?))
        },
        Some((Value::Scalar(s), _)) => match s.as_ref() {
            ScalarValue::Bytes(b) => Ok(FileContent::Binary(b.clone())),
            _ => Err(StoreError::Schema("file content is not text or bytes".into())),
        },
        _ => Err(StoreError::Schema("file document has no content".into())),
    }
}

/// Replace text content with a minimal splice against the current value.
pub fn update_text_content(doc: &mut Automerge, new_text: &str) -> Result<(), StoreError> {
    let obj = match doc.get(ROOT, F_CONTENT)? {
        Some((Value::Object(ObjType::Text), obj)) => obj,
        _ => return Err(StoreError::Schema("file content is not text".into())),
    };
    transact(doc, |tx| {
        tx.update_text(&obj, new_text)?;
        Ok(())
    })
}

/// Whole-field replace of binary content.
pub fn update_binary_content(doc: &mut Automerge, bytes: &[u8]) -> Result<(), StoreError> {
    transact(doc, |tx| {
        tx.put(ROOT, F_CONTENT, ScalarValue::Bytes(bytes.to_vec()))?;
        Ok(())
    })
}

/// Update a file document's own name fields after a move.
pub fn set_file_name(
    doc: &mut Automerge,
    name: &str,
    extension: &str,
    mime_type: &str,
) -> Result<(), StoreError> {
    transact(doc, |tx| {
        tx.put(ROOT, F_NAME, name)?;
        tx.put(ROOT, F_EXTENSION, extension)?;
        tx.put(ROOT, F_MIME, mime_type)?;
        Ok(())
    })
}

/// Recorded permission bits, when present.
pub fn file_permissions(doc: &Automerge) -> Result<Option<u32>, StoreError> {
    let meta = match doc.get(ROOT, F_METADATA)? {
        Some((Value::Object(ObjType::Map), obj)) => obj,
        _ => return Ok(None),
    };
    Ok(doc
        .get(&meta, F_PERMISSIONS)?
        .and_then(|(v, _)| as_uint(&v))
        .map(|u| u as u32))
}

// ---- tree traversal ----

/// One node reached from the root directory.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub rel_path: PathBuf,
    pub id: DocId,
    pub kind: EntryKind,
}

/// Walk the document tree from `root`, returning entries sorted so
/// parents precede their children. A document reachable twice is a
/// malformed peer tree and is rejected as a cycle.
pub fn walk(store: &DocStore, root: &DocId) -> Result<Vec<TreeEntry>, StoreError> {
    let mut seen: HashSet<DocId> = HashSet::new();
    seen.insert(root.clone());

    let mut out = Vec::new();
    let mut queue: Vec<(PathBuf, DocId)> = vec![(PathBuf::new(), root.clone())];

    while let Some((prefix, dir_id)) = queue.pop() {
        let children = store.read(&dir_id, dir_children)?;
        for child in children {
            let rel_path = prefix.join(&child.name);
            if !seen.insert(child.id.clone()) {
                return Err(StoreError::CycleDetected(child.id));
            }
            if child.kind == EntryKind::Folder {
                queue.push((rel_path.clone(), child.id.clone()));
            }
            out.push(TreeEntry { rel_path, id: child.id, kind: child.kind });
        }
    }

    out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_doc() -> Automerge {
        let mut doc = Automerge::new();
        init_directory(&mut doc).unwrap();
        doc
    }

    #[test]
    fn test_directory_children_round_trip() {
        let mut doc = dir_doc();
        let a = DocId::generate();
        let b = DocId::generate();
        add_child(&mut doc, "a.txt", EntryKind::File, &a).unwrap();
        add_child(&mut doc, "sub", EntryKind::Folder, &b).unwrap();

        let children = dir_children(&doc).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0], ChildEntry { name: "a.txt".into(), kind: EntryKind::File, id: a });
        assert_eq!(children[1].kind, EntryKind::Folder);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut doc = dir_doc();
        add_child(&mut doc, "x", EntryKind::File, &DocId::generate()).unwrap();
        let err = add_child(&mut doc, "x", EntryKind::Folder, &DocId::generate());
        assert!(matches!(err, Err(StoreError::NameCollision(_))));
    }

    #[test]
    fn test_remove_child() {
        let mut doc = dir_doc();
        add_child(&mut doc, "x", EntryKind::File, &DocId::generate()).unwrap();
        assert!(remove_child(&mut doc, "x").unwrap());
        assert!(!remove_child(&mut doc, "x").unwrap());
        assert!(dir_children(&doc).unwrap().is_empty());
    }

    #[test]
    fn test_rename_preserves_id_and_rejects_collision() {
        let mut doc = dir_doc();
        let id = DocId::generate();
        add_child(&mut doc, "old.txt", EntryKind::File, &id).unwrap();
        add_child(&mut doc, "other.txt", EntryKind::File, &DocId::generate()).unwrap();

        rename_child(&mut doc, "old.txt", "new.txt").unwrap();
        let children = dir_children(&doc).unwrap();
        assert_eq!(children[0].name, "new.txt");
        assert_eq!(children[0].id, id);

        assert!(matches!(
            rename_child(&mut doc, "new.txt", "other.txt"),
            Err(StoreError::NameCollision(_))
        ));
    }

    #[test]
    fn test_children_at_old_heads() {
        let mut doc = dir_doc();
        add_child(&mut doc, "first", EntryKind::File, &DocId::generate()).unwrap();
        let heads = doc.get_heads();
        add_child(&mut doc, "second", EntryKind::File, &DocId::generate()).unwrap();

        let old = dir_children_at(&doc, &heads).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(dir_children(&doc).unwrap().len(), 2);
    }

    #[test]
    fn test_text_file_round_trip() {
        let mut doc = Automerge::new();
        let attrs = FileAttrs {
            name: "notes.md".into(),
            extension: "md".into(),
            mime_type: "text/markdown".into(),
            permissions: Some(0o644),
        };
        init_file(&mut doc, &attrs, &FileContent::Text("hello".into())).unwrap();

        assert_eq!(file_content(&doc).unwrap(), FileContent::Text("hello".into()));
        assert_eq!(file_permissions(&doc).unwrap(), Some(0o644));

        let heads = doc.get_heads();
        update_text_content(&mut doc, "hello world").unwrap();
        assert_eq!(file_content(&doc).unwrap(), FileContent::Text("hello world".into()));
        assert_eq!(
            file_content_at(&doc, &heads).unwrap(),
            FileContent::Text("hello".into())
        );
    }

    #[test]
    fn test_binary_file_round_trip() {
        let mut doc = Automerge::new();
        let attrs = FileAttrs {
            name: "blob.dat".into(),
            extension: "dat".into(),
            mime_type: "application/octet-stream".into(),
            permissions: None,
        };
        init_file(&mut doc, &attrs, &FileContent::Binary(vec![0, 1, 2])).unwrap();

        assert_eq!(file_content(&doc).unwrap(), FileContent::Binary(vec![0, 1, 2]));
        update_binary_content(&mut doc, &[9, 9]).unwrap();
        assert_eq!(file_content(&doc).unwrap(), FileContent::Binary(vec![9, 9]));
    }

    #[test]
    fn test_walk_rejects_cycle() {
        use crate::store::DocStore;
        use tempfile::tempdir;

        let tmp = tempdir().unwrap();
        let store = DocStore::open(tmp.path()).unwrap();

        let (root, _, _) = store.create_with(|doc| init_directory(doc)).unwrap();
        let (child, _, _) = store.create_with(|doc| init_directory(doc)).unwrap();

        let root_heads = store.heads(&root).unwrap();
        store
            .change_at(&root, &root_heads, |doc| {
                add_child(doc, "sub", EntryKind::Folder, &child)
            })
            .unwrap();
        // The child points back at the root: not a tree
        let child_heads = store.heads(&child).unwrap();
        store
            .change_at(&child, &child_heads, |doc| {
                add_child(doc, "loop", EntryKind::Folder, &root)
            })
            .unwrap();

        assert!(matches!(walk(&store, &root), Err(StoreError::CycleDetected(_))));
    }

    #[test]
    fn test_walk_orders_parents_first() {
        use crate::store::DocStore;
        use tempfile::tempdir;

        let tmp = tempdir().unwrap();
        let store = DocStore::open(tmp.path()).unwrap();

        let (leaf_file, _, _) = store.create_with(|doc| {
            init_file(
                doc,
                &FileAttrs {
                    name: "f.txt".into(),
                    extension: "txt".into(),
                    mime_type: "text/plain".into(),
                    permissions: None,
                },
                &FileContent::Text(String::new()),
            )
        }).unwrap();
        let (inner, _, _) = store.create_with(|doc| {
            init_directory(doc)?;
            add_child(doc, "f.txt", EntryKind::File, &leaf_file)
        }).unwrap();
        let (root, _, _) = store.create_with(|doc| {
            init_directory(doc)?;
            add_child(doc, "dir", EntryKind::Folder, &inner)
        }).unwrap();

        let entries = walk(&store, &root).unwrap();
        let paths: Vec<_> = entries
            .iter()
            .map(|e| e.rel_path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(paths, vec!["dir", "dir/f.txt"]);
    }
}
