use ndarray::{Array1, Array2};

/// Generate a 2-D meshgrid with ij-indexing.
///
/// This is like numpy's `meshgrid(rows, cols, indexing="ij")`: both grids have shape
/// `(rows.len(), cols.len())`, the first repeats `rows` along the columns and the second
/// repeats `cols` along the rows.
pub fn meshgrid<T>(rows: &Array1<T>, cols: &Array1<T>) -> (Array2<T>, Array2<T>)
where
    T: Copy,
{
    let shape = (rows.len(), cols.len());

    let grid_rows = Array2::from_shape_fn(shape, |(i, _)| rows[i]);
    let grid_cols = Array2::from_shape_fn(shape, |(_, j)| cols[j]);

    (grid_rows, grid_cols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn ij_indexing() {
        let (ys, xs) = meshgrid(&array![0, 1, 2], &array![10, 20]);

        assert_eq!(ys, array![[0, 0], [1, 1], [2, 2]]);
        assert_eq!(xs, array![[10, 20], [10, 20], [10, 20]]);
    }

    #[test]
    fn empty_axis() {
        let (ys, xs) = meshgrid::<f32>(&Array1::zeros(0), &array![1.0, 2.0]);

        assert_eq!(ys.dim(), (0, 2));
        assert_eq!(xs.dim(), (0, 2));
    }
}
