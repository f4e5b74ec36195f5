use gridstore_model::{BigRational, ChunkId, Decimal, GridShape, RasterHeader};
use num_bigint::BigInt;
use num_traits::Signed;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

proptest! {
    #[test]
    fn every_cell_maps_to_one_chunk_offset(
        rows in 1u64..40,
        cols in 1u64..40,
        chunk_rows in 1u32..9,
        chunk_cols in 1u32..9,
    ) {
        let shape = GridShape::new(rows, cols, chunk_rows, chunk_cols).unwrap();
        let mut seen = std::collections::HashSet::new();
        for row in 0..rows as i64 {
            for col in 0..cols as i64 {
                let location = shape.locate(row, col).unwrap();
                let chunk = shape.chunk_shape(location.chunk).unwrap();
                prop_assert!(chunk.contains(location.row, location.col));
                let (origin_row, origin_col) = shape.chunk_origin(location.chunk);
                prop_assert_eq!(origin_row + location.row as u64, row as u64);
                prop_assert_eq!(origin_col + location.col as u64, col as u64);
                prop_assert!(seen.insert((location.chunk, location.row, location.col)));
            }
        }
        let cells: u64 = shape
            .chunk_ids()
            .map(|id| shape.chunk_shape(id).unwrap().cells() as u64)
            .sum();
        prop_assert_eq!(cells, shape.cell_count());
        prop_assert!(shape.locate(rows as i64, 0).is_none());
        prop_assert!(shape.locate(0, -1).is_none());
    }

    #[test]
    fn rounding_stays_within_half_a_unit(
        numer in -100_000i64..100_000,
        denom in 1i64..1000,
        scale in 0u32..6,
    ) {
        let exact = BigRational::new(numer.into(), denom.into());
        let rounded = Decimal::from_rational(&exact, scale);
        let unit = BigRational::new(1.into(), BigInt::from(10).pow(scale));
        let error = (rounded.to_rational() - &exact).abs();
        prop_assert!(error * BigRational::from_integer(2.into()) <= unit);
        prop_assert_eq!(rounded.to_string().parse::<Decimal>().unwrap(), rounded);
    }
}

#[test]
fn headers_and_ids_round_trip_through_json() {
    let header = RasterHeader {
        cell_size: 30.0,
        origin_x: 500_000.0,
        ..RasterHeader::new(120, 80, -9999i32)
    };
    let json = serde_json::to_string(&header).unwrap();
    assert_eq!(serde_json::from_str::<RasterHeader<i32>>(&json).unwrap(), header);
    assert_eq!(header.cell_count(), 9600);

    let id = ChunkId::new(3, 7);
    assert_eq!(id.to_string(), "(3, 7)");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(serde_json::from_str::<ChunkId>(&json).unwrap(), id);
}
