/// How a catalog entity is matched against a user-typed reference.
pub trait CatalogMatch {
    fn canonical_name(&self) -> &str;

    /// Exact match by value or by one of the entity's named properties.
    fn matches_exact(&self, candidate: &str) -> bool;

    /// Case-insensitive substring match; `needle` is already lowercased.
    fn matches_partial(&self, needle: &str) -> bool {
        self.canonical_name().to_lowercase().contains(needle)
    }
}

impl CatalogMatch for String {
    fn canonical_name(&self) -> &str {
        self.as_str()
    }

    fn matches_exact(&self, candidate: &str) -> bool {
        self == candidate || strip_hash_suffix(self) == candidate
    }
}

/// Resolve the first candidate that matches any entry.
///
/// Each candidate first tries an exact match over every entry and only then a
/// partial match, before the next candidate is considered.
pub fn find<'a, T, S, I>(candidates: &[S], entries: I) -> Option<&'a T>
where
    T: CatalogMatch + 'a,
    S: AsRef<str>,
    I: IntoIterator<Item = &'a T>,
    I::IntoIter: Clone,
{
    let entries = entries.into_iter();
    for candidate in candidates {
        let candidate = candidate.as_ref().trim();
        if candidate.is_empty() {
            continue;
        }
        if let Some(entry) = entries
            .clone()
            .find(|entry| entry.matches_exact(candidate))
        {
            return Some(entry);
        }
        let needle = candidate.to_lowercase();
        if let Some(entry) = entries
            .clone()
            .find(|entry| entry.matches_partial(&needle))
        {
            return Some(entry);
        }
    }
    None
}

/// `"name [abc123]"` to `"name"`.
pub fn strip_hash_suffix(value: &str) -> &str {
    let trimmed = value.trim_end();
    if trimmed.ends_with(']') {
        if let Some(idx) = trimmed.rfind(" [") {
            return &trimmed[..idx];
        }
    }
    trimmed
}

/// `"SDXL/dream.safetensors [abc]"` to `"dream"`.
pub fn file_stem(value: &str) -> &str {
    let name = strip_hash_suffix(value);
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    }
}
