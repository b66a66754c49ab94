use orus_asm::{Chunk, LineTable, Opcode};
use quickcheck_macros::quickcheck;

#[quickcheck]
fn line_table_resolves_every_offset(spans: Vec<(u32, u32, u8)>) -> bool {
    let mut table = LineTable::new();
    let mut expected = Vec::new();

    for (line, column, count) in spans {
        let line = line.max(1);
        let column = column.max(1);
        let count = count as usize % 7 + 1;
        table.push_span(line, column, count);
        for _ in 0..count {
            expected.push((line, column));
        }
    }

    expected.iter().enumerate().all(|(offset, &(line, column))| {
        table
            .locate(offset)
            .map(|pos| pos.line == line && pos.column == column)
            .unwrap_or(false)
    }) && table.locate(expected.len()).is_none()
}

#[quickcheck]
fn u16_operands_round_trip(values: Vec<u16>) -> bool {
    let mut chunk: Chunk<i64> = Chunk::new();
    for &v in &values {
        chunk.write_op(Opcode::Jump, 1, 1);
        chunk.write_u16(v, 1, 1);
    }

    values
        .iter()
        .enumerate()
        .all(|(i, &v)| chunk.read_u16(i * 3 + 1).unwrap() == v)
}

#[test]
fn instruction_stream_walk() {
    let mut chunk: Chunk<i64> = Chunk::new();

    chunk.write_op(Opcode::LoadConst, 1, 1);
    chunk.write_u8(64, 1, 1);
    chunk.write_u16(0, 1, 1);

    chunk.write_op(Opcode::AddI32, 1, 5);
    chunk.write_u8(66, 1, 5);
    chunk.write_u8(64, 1, 5);
    chunk.write_u8(65, 1, 5);

    chunk.write_op(Opcode::Return, 2, 1);
    chunk.write_u8(66, 2, 1);

    let mut offset = 0;
    let mut ops = Vec::new();
    while offset < chunk.len() {
        ops.push(chunk.opcode_at(offset).unwrap());
        offset = chunk.next_offset(offset).unwrap();
    }

    assert_eq!(ops, [Opcode::LoadConst, Opcode::AddI32, Opcode::Return]);
    assert_eq!(offset, chunk.len());
}

#[test]
fn disassembly_includes_position_and_mnemonic() {
    let mut chunk: Chunk<i64> = Chunk::new();
    chunk.write_op(Opcode::Print, 3, 9);
    chunk.write_u8(64, 3, 9);

    let line = chunk.disassemble_at(0);
    assert!(line.contains("print"), "{line}");
    assert!(line.contains("3:9"), "{line}");
}
