//! 層化分割（stratified split）
//!
//! 各分割のクラス比率が元データのクラス比率と（丸め誤差の範囲で）一致するように
//! インデックスを振り分けます。
//!
//! 分割は2段階で行います:
//! 1. 全体から `test_ratio` をテスト用に切り出す
//! 2. 残りから `val_ratio / (1 - test_ratio)` を検証用に切り出す

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;

/// 3分割の結果（元配列へのインデックス）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
    pub test: Vec<usize>,
}

/// 浮動小数の誤差で ceil が1つずれないようにする
fn ceil_count(fraction: f64, total: usize) -> usize {
    let raw = fraction * total as f64;
    ((raw - 1e-9).ceil().max(0.0) as usize).min(total)
}

/// `subset` を層化して (残り, 切り出し) に分ける
///
/// 切り出し数は `ceil(fraction * n)`。クラスごとの割り当ては
/// 比例配分の切り捨て + 端数の大きい順に残りを配る（最大剰余法）ため、
/// 各クラスの枚数は厳密な比例配分から1枚以内に収まります。
pub fn stratified_split(
    labels: &[usize],
    subset: &[usize],
    fraction: f64,
    rng: &mut StdRng,
) -> (Vec<usize>, Vec<usize>) {
    let total = subset.len();
    let split_total = ceil_count(fraction, total);

    // クラスごとにインデックスをまとめる（BTreeMapでクラス順を固定）
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &idx in subset {
        by_class.entry(labels[idx]).or_default().push(idx);
    }

    // 比例配分の切り捨て値と端数
    let mut allocations: Vec<(usize, usize, f64)> = by_class
        .iter()
        .map(|(&class, members)| {
            let exact = split_total as f64 * members.len() as f64 / total.max(1) as f64;
            let floor = exact.floor() as usize;
            (class, floor.min(members.len()), exact - floor as f64)
        })
        .collect();

    let mut remaining = split_total.saturating_sub(allocations.iter().map(|a| a.1).sum::<usize>());

    // 端数の大きいクラスから1枚ずつ追加
    let mut order: Vec<usize> = (0..allocations.len()).collect();
    order.sort_by(|&a, &b| {
        allocations[b]
            .2
            .partial_cmp(&allocations[a].2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(allocations[a].0.cmp(&allocations[b].0))
    });
    for &i in order.iter().cycle().take(order.len() * 2) {
        if remaining == 0 {
            break;
        }
        let class_size = by_class[&allocations[i].0].len();
        if allocations[i].1 < class_size {
            allocations[i].1 += 1;
            remaining -= 1;
        }
    }

    let mut keep = Vec::with_capacity(total - split_total);
    let mut split = Vec::with_capacity(split_total);

    for (class, count, _) in allocations {
        let mut members = by_class.remove(&class).unwrap_or_default();
        members.shuffle(rng);
        let rest = members.split_off(count);
        split.extend(members);
        keep.extend(rest);
    }

    keep.shuffle(rng);
    split.shuffle(rng);
    (keep, split)
}

/// train / val / test の3分割
pub fn split_train_val_test(labels: &[usize], val_ratio: f64, test_ratio: f64, seed: u64) -> SplitIndices {
    let mut rng = StdRng::seed_from_u64(seed);
    let all: Vec<usize> = (0..labels.len()).collect();

    let (train_val, test) = stratified_split(labels, &all, test_ratio, &mut rng);

    // 残りに対する検証データの割合に補正
    let adjusted_val = if test_ratio < 1.0 {
        val_ratio / (1.0 - test_ratio)
    } else {
        0.0
    };
    let (train, val) = stratified_split(labels, &train_val, adjusted_val, &mut rng);

    SplitIndices { train, val, test }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(labels: &[usize], indices: &[usize], class: usize) -> usize {
        indices.iter().filter(|&&i| labels[i] == class).count()
    }

    #[test]
    fn test_two_balanced_classes_split_14_3_3() {
        let labels: Vec<usize> = (0..40).map(|i| i % 2).collect();
        let split = split_train_val_test(&labels, 0.15, 0.15, 42);

        for class in 0..2 {
            assert_eq!(count(&labels, &split.train, class), 14);
            assert_eq!(count(&labels, &split.val, class), 3);
            assert_eq!(count(&labels, &split.test, class), 3);
        }
    }

    #[test]
    fn test_partitions_are_disjoint_and_complete() {
        let labels: Vec<usize> = (0..103).map(|i| i % 4).collect();
        let split = split_train_val_test(&labels, 0.15, 0.15, 7);

        let mut all: Vec<usize> = split
            .train
            .iter()
            .chain(&split.val)
            .chain(&split.test)
            .copied()
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..103).collect::<Vec<_>>());
    }

    #[test]
    fn test_imbalanced_classes_stay_within_one_sample() {
        // 60 / 25 / 15
        let mut labels = vec![0; 60];
        labels.extend(vec![1; 25]);
        labels.extend(vec![2; 15]);
        let total = labels.len() as f64;
        let class_sizes = [60.0, 25.0, 15.0];

        let split = split_train_val_test(&labels, 0.15, 0.15, 42);
        for part in [&split.train, &split.val, &split.test] {
            let part_len = part.len() as f64;
            for (class, size) in class_sizes.iter().enumerate() {
                let expected = part_len * size / total;
                let actual = count(&labels, part, class) as f64;
                assert!(
                    (actual - expected).abs() <= 1.0,
                    "class {} expected {:.2} got {}",
                    class,
                    expected,
                    actual
                );
            }
        }
    }

    #[test]
    fn test_split_is_reproducible_with_seed() {
        let labels: Vec<usize> = (0..50).map(|i| i % 3).collect();
        assert_eq!(
            split_train_val_test(&labels, 0.15, 0.15, 42),
            split_train_val_test(&labels, 0.15, 0.15, 42)
        );
    }

    #[test]
    fn test_empty_input() {
        let split = split_train_val_test(&[], 0.15, 0.15, 42);
        assert!(split.train.is_empty() && split.val.is_empty() && split.test.is_empty());
    }

    #[test]
    fn test_ceil_count_ignores_float_noise() {
        // 34 * (0.15 / 0.85) は浮動小数では 6.000000000000001 になり得る
        assert_eq!(ceil_count(0.15 / 0.85, 34), 6);
        assert_eq!(ceil_count(0.15, 40), 6);
        assert_eq!(ceil_count(0.15, 41), 7);
        assert_eq!(ceil_count(1.5, 4), 4);
    }
}
