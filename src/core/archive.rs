//! 推送压缩包 - 打包与解包
//!
//! 压缩包是普通 zip，第一个成员是 `_delta_metadata.json` 清单，其余成员按
//! 项目相对路径存放文件内容。被删除的文件只出现在清单里。

use crate::core::fingerprint::{normalize_rel_path, STATE_DIR};
use crate::core::strategy::TransferKind;
use crate::error::{HotpushError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// 清单在压缩包中的名称
pub const MANIFEST_NAME: &str = "_delta_metadata.json";

/// 压缩包清单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "type")]
    pub kind: TransferKind,
    /// Unix 时间戳（秒，带小数）
    pub timestamp: f64,
    pub file_count: usize,
    pub files: Vec<String>,
    #[serde(default)]
    pub deleted_files: Vec<String>,
}

impl Manifest {
    pub fn new(kind: TransferKind, files: Vec<String>, deleted_files: Vec<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            kind,
            timestamp: now.timestamp_millis() as f64 / 1000.0,
            file_count: files.len(),
            files,
            deleted_files,
        }
    }
}

/// 打包结果
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub path: PathBuf,
    pub manifest: Manifest,
    /// 压缩包大小（字节）
    pub size: u64,
    /// 打包时已不存在、未写入内容的文件
    pub skipped: Vec<String>,
}

/// 打包
///
/// 清单中的 `files` 保持调用方给出的列表；打包时已经消失的文件只是不写入内容，
/// 接收端会把缺失的成员当作"无需更新"。
pub fn build_archive<'a, I, D>(
    root: &Path,
    output: &Path,
    kind: TransferKind,
    files: I,
    deleted: D,
) -> Result<BuiltArchive>
where
    I: IntoIterator<Item = &'a String>,
    D: IntoIterator<Item = &'a String>,
{
    let files: Vec<String> = files.into_iter().cloned().collect();
    let deleted: Vec<String> = deleted.into_iter().cloned().collect();
    let manifest = Manifest::new(kind, files, deleted);

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).map_err(|e| HotpushError::io(parent, e))?;
    }
    let file = File::create(output).map_err(|e| HotpushError::io(output, e))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(MANIFEST_NAME, options)?;
    zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())
        .map_err(|e| HotpushError::io(output, e))?;

    let mut skipped = Vec::new();
    for rel in &manifest.files {
        let abs = root.join(rel);
        let data = match fs::read(&abs) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("打包时文件已不存在，跳过: {}", rel);
                skipped.push(rel.clone());
                continue;
            }
            Err(e) => return Err(HotpushError::io(abs, e)),
        };

        zip.start_file(rel.as_str(), options)?;
        zip.write_all(&data).map_err(|e| HotpushError::io(output, e))?;
        debug!("已加入压缩包: {}", rel);
    }

    zip.finish()?;

    let size = fs::metadata(output)
        .map_err(|e| HotpushError::io(output, e))?
        .len();

    info!(
        "已创建 {} 压缩包: {} 个文件, {} 个删除 ({:.1} KB)",
        manifest.kind,
        manifest.files.len() - skipped.len(),
        manifest.deleted_files.len(),
        size as f64 / 1024.0
    );

    Ok(BuiltArchive {
        path: output.to_path_buf(),
        manifest,
        size,
        skipped,
    })
}

/// 解包后实际发生的变化
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChangeSet {
    pub kind: TransferKind,
    /// 内容发生变化（新增或覆盖）的文件，包括上次中断的解包已经改过的文件
    pub written: BTreeSet<String>,
    /// 写入前后内容相同的文件
    pub unchanged: BTreeSet<String>,
    /// 清单列出但压缩包中没有内容的文件
    pub missing: BTreeSet<String>,
    /// 清单要求删除的文件
    pub deleted: BTreeSet<String>,
}

impl AppliedChangeSet {
    /// 需要触发重载的路径：写入 ∪ 删除
    pub fn changed_paths(&self) -> BTreeSet<String> {
        self.written.union(&self.deleted).cloned().collect()
    }
}

/// 把相对路径解析到项目根目录下，拒绝越界路径
fn resolve_in_root(root: &Path, rel: &str) -> Result<(String, PathBuf)> {
    let normalized =
        normalize_rel_path(Path::new(rel)).ok_or_else(|| HotpushError::UnsafeEntry(rel.to_string()))?;
    let target = root.join(&normalized);
    Ok((normalized, target))
}

/// 解包中断时记录的路径，位于项目状态目录下
pub const PENDING_APPLY_FILE: &str = "pending_apply.json";

fn pending_path(root: &Path) -> PathBuf {
    root.join(STATE_DIR).join(PENDING_APPLY_FILE)
}

fn load_pending(root: &Path) -> BTreeSet<String> {
    let path = pending_path(root);
    let Ok(content) = fs::read_to_string(&path) else {
        return BTreeSet::new();
    };
    match serde_json::from_str(&content) {
        Ok(paths) => paths,
        Err(e) => {
            warn!("无法解析 {:?}: {}", path, e);
            BTreeSet::new()
        }
    }
}

fn save_pending(root: &Path, paths: &BTreeSet<String>) -> Result<()> {
    let path = pending_path(root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| HotpushError::io(parent, e))?;
    }
    fs::write(&path, serde_json::to_vec(paths)?).map_err(|e| HotpushError::io(&path, e))
}

fn clear_pending(root: &Path) {
    let path = pending_path(root);
    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("无法删除 {:?}: {}", path, e);
        }
    }
}

/// 写到目标旁边的临时文件，返回临时文件路径
fn stage_file(target: &Path, data: &[u8]) -> Result<PathBuf> {
    let parent = target.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(|e| HotpushError::io(parent, e))?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.hotpush-tmp", name));
    fs::write(&tmp, data).map_err(|e| HotpushError::io(&tmp, e))?;
    Ok(tmp)
}

fn discard_staged<'a>(staged: impl Iterator<Item = &'a PathBuf>) {
    for tmp in staged {
        let _ = fs::remove_file(tmp);
    }
}

/// 从内存中的压缩包应用更新
pub fn apply_archive(root: &Path, archive_bytes: &[u8]) -> Result<AppliedChangeSet> {
    apply_archive_from(root, Cursor::new(archive_bytes))
}

/// 解包到项目根目录
///
/// 所有成员先写到临时文件，全部成功后再替换目标；清单中的删除是幂等的，
/// 文件不存在不算错误。替换开始前把要改动的路径记入 `pending_apply.json`，
/// 解包中途失败时，下一次解包会把这些路径重新算作已变化。
pub fn apply_archive_from<R: Read + Seek>(root: &Path, reader: R) -> Result<AppliedChangeSet> {
    let mut archive = ZipArchive::new(reader)?;

    let manifest: Manifest = {
        let mut entry = match archive.by_name(MANIFEST_NAME) {
            Ok(e) => e,
            Err(zip::result::ZipError::FileNotFound) => return Err(HotpushError::MissingManifest),
            Err(e) => return Err(e.into()),
        };
        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .map_err(|e| HotpushError::io(MANIFEST_NAME, e))?;
        serde_json::from_str(&content)?
    };

    info!(
        "收到 {} 压缩包: {} 个文件, {} 个删除",
        manifest.kind,
        manifest.files.len(),
        manifest.deleted_files.len()
    );

    // 先校验全部成员路径，避免写到一半才发现非法路径
    let mut members = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.is_dir() || entry.name() == MANIFEST_NAME {
            continue;
        }
        let (rel, target) = resolve_in_root(root, entry.name())?;
        members.push((i, rel, target));
    }

    let mut deletions = Vec::new();
    for rel in &manifest.deleted_files {
        deletions.push(resolve_in_root(root, rel)?);
    }

    // 上次中断的解包已经改过但还没重载的文件
    let pending = load_pending(root);
    if !pending.is_empty() {
        warn!("上次解包未完成，{} 个文件将重新触发重载", pending.len());
    }

    // 写入前先和磁盘比较，分类不受本次写入影响
    let mut written = BTreeSet::new();
    let mut unchanged = BTreeSet::new();
    let mut to_write = Vec::new();

    for (index, rel, target) in members {
        if target.is_dir() {
            return Err(HotpushError::io(
                &target,
                std::io::Error::new(std::io::ErrorKind::Other, "目标是目录"),
            ));
        }

        let mut entry = archive.by_index(index)?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| HotpushError::io(&target, e))?;

        if fs::read(&target).map(|old| old == data).unwrap_or(false) {
            if pending.contains(&rel) {
                written.insert(rel);
            } else {
                unchanged.insert(rel);
            }
            continue;
        }
        written.insert(rel.clone());
        to_write.push((rel, target, data));
    }

    // 先全部写到临时文件，失败时项目目录保持原样
    let mut staged = Vec::with_capacity(to_write.len());
    for (rel, target, data) in &to_write {
        match stage_file(target, data) {
            Ok(tmp) => staged.push((rel, tmp, target)),
            Err(e) => {
                discard_staged(staged.iter().map(|(_, tmp, _)| tmp));
                return Err(e);
            }
        }
    }

    let mut journal = pending.clone();
    journal.extend(written.iter().cloned());
    journal.extend(deletions.iter().map(|(rel, _)| rel.clone()));
    if !journal.is_empty() {
        if let Err(e) = save_pending(root, &journal) {
            discard_staged(staged.iter().map(|(_, tmp, _)| tmp));
            return Err(e);
        }
    }

    for (rel, tmp, target) in &staged {
        if let Err(e) = fs::rename(tmp, target) {
            discard_staged(staged.iter().map(|(_, tmp, _)| tmp));
            return Err(HotpushError::io(*target, e));
        }
        debug!("已写入: {}", rel);
    }

    let mut deleted = BTreeSet::new();
    for (rel, target) in deletions {
        match fs::remove_file(&target) {
            Ok(()) => debug!("已删除: {}", rel),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(HotpushError::io(&target, e)),
        }
        deleted.insert(rel);
    }

    // 不在本次压缩包里的遗留文件按现状归类
    for rel in pending {
        if written.contains(&rel) || unchanged.contains(&rel) || deleted.contains(&rel) {
            continue;
        }
        if root.join(&rel).exists() {
            written.insert(rel);
        } else {
            deleted.insert(rel);
        }
    }
    clear_pending(root);

    let missing: BTreeSet<String> = manifest
        .files
        .iter()
        .filter(|f| !written.contains(*f) && !unchanged.contains(*f))
        .cloned()
        .collect();
    if !missing.is_empty() {
        warn!("清单中有 {} 个文件没有内容，视为无需更新", missing.len());
    }

    info!(
        "解包完成: {} 个写入, {} 个未变化, {} 个删除",
        written.len(),
        unchanged.len(),
        deleted.len()
    );

    Ok(AppliedChangeSet {
        kind: manifest.kind,
        written,
        unchanged,
        missing,
        deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn read(root: &Path, rel: &str) -> String {
        fs::read_to_string(root.join(rel)).unwrap()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_manifest_json_shape() {
        let manifest = Manifest::new(TransferKind::Delta, vec!["a.py".into()], vec!["c.py".into()]);
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["type"], "delta");
        assert_eq!(value["file_count"], 1);
        assert_eq!(value["files"][0], "a.py");
        assert_eq!(value["deleted_files"][0], "c.py");
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_manifest_is_first_entry() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "a.py", "A");
        let out = src.path().join("out.zip");
        build_archive(src.path(), &out, TransferKind::Full, &set(&["a.py"]), &BTreeSet::new())
            .unwrap();

        let mut archive = ZipArchive::new(File::open(&out).unwrap()).unwrap();
        assert_eq!(archive.by_index(0).unwrap().name(), MANIFEST_NAME);
        assert_eq!(archive.by_index(1).unwrap().name(), "a.py");
    }

    #[test]
    fn test_delta_round_trip() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "a.py", "new a");
        write(src.path(), "b.py", "new b");
        write(src.path(), "untouched.py", "sender copy");

        let out = src.path().join(".hotpush/app_copy.zip");
        let built = build_archive(
            src.path(),
            &out,
            TransferKind::Delta,
            &set(&["a.py", "b.py"]),
            &set(&["c.py"]),
        )
        .unwrap();
        assert!(built.skipped.is_empty());

        let dst = tempfile::tempdir().unwrap();
        write(dst.path(), "a.py", "old a");
        write(dst.path(), "b.py", "old b");
        write(dst.path(), "c.py", "old c");
        write(dst.path(), "untouched.py", "device copy");

        let bytes = fs::read(&out).unwrap();
        let applied = apply_archive(dst.path(), &bytes).unwrap();

        assert_eq!(read(dst.path(), "a.py"), "new a");
        assert_eq!(read(dst.path(), "b.py"), "new b");
        assert!(!dst.path().join("c.py").exists());
        assert_eq!(read(dst.path(), "untouched.py"), "device copy");

        assert_eq!(applied.kind, TransferKind::Delta);
        assert_eq!(applied.written, set(&["a.py", "b.py"]));
        assert_eq!(applied.deleted, set(&["c.py"]));
        assert_eq!(applied.changed_paths(), set(&["a.py", "b.py", "c.py"]));
    }

    #[test]
    fn test_missing_file_keeps_manifest_listing() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "a.py", "A");
        let out = src.path().join("out.zip");
        let built = build_archive(
            src.path(),
            &out,
            TransferKind::Delta,
            &set(&["a.py", "gone.py"]),
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(built.manifest.files, vec!["a.py".to_string(), "gone.py".to_string()]);
        assert_eq!(built.skipped, vec!["gone.py".to_string()]);

        let dst = tempfile::tempdir().unwrap();
        let applied = apply_archive(dst.path(), &fs::read(&out).unwrap()).unwrap();
        assert_eq!(applied.written, set(&["a.py"]));
        assert_eq!(applied.missing, set(&["gone.py"]));
        assert!(!dst.path().join("gone.py").exists());
    }

    #[test]
    fn test_identical_content_reported_unchanged() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "main.py", "same");
        write(src.path(), "screens/a.py", "edited");
        let out = src.path().join("out.zip");
        build_archive(
            src.path(),
            &out,
            TransferKind::Full,
            &set(&["main.py", "screens/a.py"]),
            &BTreeSet::new(),
        )
        .unwrap();

        let dst = tempfile::tempdir().unwrap();
        write(dst.path(), "main.py", "same");
        write(dst.path(), "screens/a.py", "original");
        let applied = apply_archive(dst.path(), &fs::read(&out).unwrap()).unwrap();

        assert_eq!(applied.written, set(&["screens/a.py"]));
        assert_eq!(applied.unchanged, set(&["main.py"]));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let src = tempfile::tempdir().unwrap();
        let out = src.path().join("out.zip");
        build_archive(
            src.path(),
            &out,
            TransferKind::Delta,
            &BTreeSet::new(),
            &set(&["never_existed.py"]),
        )
        .unwrap();

        let dst = tempfile::tempdir().unwrap();
        let bytes = fs::read(&out).unwrap();
        apply_archive(dst.path(), &bytes).unwrap();
        let applied = apply_archive(dst.path(), &bytes).unwrap();
        assert_eq!(applied.deleted, set(&["never_existed.py"]));
    }

    #[test]
    fn test_archive_without_manifest_is_rejected() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            zip.start_file("a.py", FileOptions::default()).unwrap();
            zip.write_all(b"A").unwrap();
            zip.finish().unwrap();
        }
        let dst = tempfile::tempdir().unwrap();
        let err = apply_archive(dst.path(), buf.get_ref()).unwrap_err();
        assert!(matches!(err, HotpushError::MissingManifest));
        assert!(!dst.path().join("a.py").exists());
    }

    #[test]
    fn test_traversal_entry_is_rejected() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            let manifest = Manifest::new(TransferKind::Delta, vec!["../evil.py".into()], vec![]);
            zip.start_file(MANIFEST_NAME, FileOptions::default()).unwrap();
            zip.write_all(serde_json::to_string(&manifest).unwrap().as_bytes())
                .unwrap();
            zip.start_file("../evil.py", FileOptions::default()).unwrap();
            zip.write_all(b"x").unwrap();
            zip.finish().unwrap();
        }
        let parent = tempfile::tempdir().unwrap();
        let dst = parent.path().join("project");
        fs::create_dir_all(&dst).unwrap();
        let err = apply_archive(&dst, buf.get_ref()).unwrap_err();
        assert!(matches!(err, HotpushError::UnsafeEntry(_)));
        assert!(!parent.path().join("evil.py").exists());
    }

    fn delta_of(src: &Path, files: &[&str]) -> Vec<u8> {
        let out = src.join("out.zip");
        build_archive(src, &out, TransferKind::Delta, &set(files), &BTreeSet::new()).unwrap();
        fs::read(&out).unwrap()
    }

    #[test]
    fn test_failed_apply_leaves_tree_untouched() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "a.py", "A = 2");
        write(src.path(), "b.py", "B = 2");
        let bytes = delta_of(src.path(), &["a.py", "b.py"]);

        let dst = tempfile::tempdir().unwrap();
        write(dst.path(), "a.py", "A = 1");
        fs::create_dir_all(dst.path().join("b.py")).unwrap();

        assert!(apply_archive(dst.path(), &bytes).is_err());
        assert_eq!(read(dst.path(), "a.py"), "A = 1");
        assert!(!dst.path().join(".a.py.hotpush-tmp").exists());

        // 重试时两个文件都算作变化
        fs::remove_dir(dst.path().join("b.py")).unwrap();
        let applied = apply_archive(dst.path(), &bytes).unwrap();
        assert_eq!(applied.changed_paths(), set(&["a.py", "b.py"]));
        assert_eq!(read(dst.path(), "a.py"), "A = 2");
    }

    #[test]
    fn test_retry_after_interrupted_apply_reports_written_files() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "a.py", "A = 2");
        write(src.path(), "main.py", "run(debug=True)");
        let bytes = delta_of(src.path(), &["a.py", "main.py"]);

        // a.py 和 main.py 已被上次解包替换，但没有完成
        let dst = tempfile::tempdir().unwrap();
        write(dst.path(), "a.py", "A = 2");
        write(dst.path(), "main.py", "run(debug=True)");
        save_pending(dst.path(), &set(&["a.py", "main.py", "screens/home.py"])).unwrap();

        let applied = apply_archive(dst.path(), &bytes).unwrap();
        assert_eq!(applied.written, set(&["a.py", "main.py"]));
        assert!(applied.unchanged.is_empty());
        // 不在本次压缩包里、磁盘上也不存在的遗留路径按删除处理
        assert_eq!(applied.deleted, set(&["screens/home.py"]));
        assert!(!pending_path(dst.path()).exists());

        // 成功后记录被清除，再次应用视为未变化
        let applied = apply_archive(dst.path(), &bytes).unwrap();
        assert!(applied.written.is_empty());
        assert_eq!(applied.unchanged, set(&["a.py", "main.py"]));
    }

    #[test]
    fn test_declared_size_is_not_trusted() {
        let manifest = Manifest::new(TransferKind::Delta, vec!["a.py".into()], Vec::new());
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            zip.start_file(MANIFEST_NAME, options).unwrap();
            zip.write_all(&serde_json::to_vec(&manifest).unwrap()).unwrap();
            zip.start_file("a.py", options).unwrap();
            zip.write_all(b"A = 1").unwrap();
            zip.finish().unwrap();
        }
        let mut bytes = buf.into_inner();

        // 把中央目录里 a.py 的解压大小改成接近 2 GiB
        let header = (0..bytes.len() - 50)
            .find(|&i| &bytes[i..i + 4] == b"PK\x01\x02" && &bytes[i + 46..i + 50] == b"a.py")
            .unwrap();
        bytes[header + 24..header + 28].copy_from_slice(&0x7fff_fff0u32.to_le_bytes());

        let dst = tempfile::tempdir().unwrap();
        let applied = apply_archive(dst.path(), &bytes).unwrap();
        assert_eq!(applied.written, set(&["a.py"]));
        assert_eq!(read(dst.path(), "a.py"), "A = 1");
    }
}
