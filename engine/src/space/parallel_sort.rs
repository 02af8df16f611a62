//! Hybrid quicksort for particle binning.
//!
//! Sorts the bin-index array and the particle array in lockstep. The two
//! recursion branches run on independent workers once a partition is
//! large enough to pay for the spawn; below that, plain recursion, and at
//! the bottom an insertion sort.

use super::Part;

const INSERTION_CUTOFF: usize = 16;
const PARALLEL_CUTOFF: usize = 100;

/// Sort `parts` by `ind`, ascending, permuting both in lockstep.
pub fn sort_by_bin(ind: &mut [u32], parts: &mut [Part]) {
    debug_assert_eq!(ind.len(), parts.len());
    qsort(ind, parts);
    debug_assert!(ind.windows(2).all(|w| w[0] <= w[1]), "binning sort failed");
}

fn qsort(ind: &mut [u32], parts: &mut [Part]) {
    let n = ind.len();
    if n < INSERTION_CUTOFF {
        insertion_sort(ind, parts);
        return;
    }

    // median-of-three, moved to the front as the pivot
    let (lo, mid, hi) = (0, n / 2, n - 1);
    if ind[mid] < ind[lo] {
        swap(ind, parts, lo, mid);
    }
    if ind[hi] < ind[lo] {
        swap(ind, parts, lo, hi);
    }
    if ind[mid] < ind[hi] {
        swap(ind, parts, mid, hi);
    }
    swap(ind, parts, lo, hi);
    let pivot = ind[lo];

    // hoare partition
    let mut i = -1isize;
    let mut j = n as isize;
    loop {
        loop {
            i += 1;
            if ind[i as usize] >= pivot {
                break;
            }
        }
        loop {
            j -= 1;
            if ind[j as usize] <= pivot {
                break;
            }
        }
        if i >= j {
            break;
        }
        swap(ind, parts, i as usize, j as usize);
    }
    let split = (j + 1) as usize;

    let (ind_lo, ind_hi) = ind.split_at_mut(split);
    let (parts_lo, parts_hi) = parts.split_at_mut(split);
    if !cfg!(feature = "space-disable-par") && n > PARALLEL_CUTOFF {
        rayon::join(|| qsort(ind_lo, parts_lo), || qsort(ind_hi, parts_hi));
    } else {
        qsort(ind_lo, parts_lo);
        qsort(ind_hi, parts_hi);
    }
}

fn insertion_sort(ind: &mut [u32], parts: &mut [Part]) {
    for i in 1..ind.len() {
        let mut j = i;
        while j > 0 && ind[j - 1] > ind[j] {
            swap(ind, parts, j - 1, j);
            j -= 1;
        }
    }
}

fn swap(ind: &mut [u32], parts: &mut [Part], a: usize, b: usize) {
    ind.swap(a, b);
    parts.swap(a, b);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn sorts_and_keeps_particles_attached() {
        let mut rng = StdRng::seed_from_u64(123);
        let mut ind: Vec<u32> = (0..4096).map(|_| rng.gen_range(0..64)).collect();
        // tag each particle with its key so we can check the permutation
        let mut parts: Vec<Part> = ind
            .iter()
            .map(|&key| Part { x: [key as f64, 0.0, 0.0], h: 1.0, ..Default::default() })
            .collect();
        sort_by_bin(&mut ind, &mut parts);
        assert!(ind.windows(2).all(|w| w[0] <= w[1]));
        for (key, p) in ind.iter().zip(&parts) {
            assert_eq!(*key as f64, p.x[0]);
        }
    }

    #[test]
    fn handles_tiny_and_constant_inputs() {
        let mut ind = vec![5u32; 100];
        let mut parts = vec![Part::default(); 100];
        sort_by_bin(&mut ind, &mut parts);
        assert!(ind.iter().all(|&v| v == 5));

        let mut ind: Vec<u32> = (0..8).rev().collect();
        let mut parts = vec![Part::default(); 8];
        sort_by_bin(&mut ind, &mut parts);
        assert_eq!(ind, (0..8).collect::<Vec<_>>());
    }
}
