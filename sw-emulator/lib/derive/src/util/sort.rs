/*++

Licensed under the Apache-2.0 license.

File Name:

    sort.rs

Abstract:

    General-purpose functions for sorting.

--*/
pub fn sorted_by_key<K: Ord, T>(
    iter: impl Iterator<Item = T>,
    f: impl FnMut(&T) -> K,
) -> impl DoubleEndedIterator<Item = T> {
    let mut result = Vec::from_iter(iter);
    result.sort_by_key(f);
    result.into_iter()
}
