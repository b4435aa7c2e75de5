//! End-to-end assembly of the classic hello-world `main` body, checking the
//! exact constant pool layout and emitted bytes.

use classfile_emit::class_file::{
    ClassAccessFlags, ClassFile, Method, MethodAccessFlags, MethodAssembler, Serialize, Version,
};
use classfile_emit::code::{Const, Insn, MemberRef, Op};
use classfile_emit::pool::ConstantPool;
use classfile_emit::verifier::VerificationType;

fn hello_world_body() -> Insn {
    Insn::Seq(vec![
        Insn::Op(Op::GetStatic(MemberRef::new(
            "java/lang/System",
            "out",
            "Ljava/io/PrintStream;",
        ))),
        Insn::Op(Op::Ldc(Const::String("Hello, World!".to_owned()))),
        Insn::Op(Op::InvokeVirtual(MemberRef::new(
            "java/io/PrintStream",
            "println",
            "(Ljava/lang/String;)V",
        ))),
        Insn::Op(Op::Return),
    ])
}

#[test]
fn code_bytes_and_limits() {
    let mut pool = ConstantPool::new();
    let assembler = MethodAssembler::new(&mut pool, Vec::new(), None).unwrap();
    let code = assembler.assemble(&hello_world_body()).unwrap();

    assert_eq!(
        code.bytecode,
        [0xb2, 0x00, 0x09, 0x12, 0x03, 0xb6, 0x00, 0x0f, 0xb1],
    );
    assert_eq!(code.max_stack, 2);
    assert_eq!(code.max_locals, 0);
    assert!(code.exception_table.is_empty());
    // straight-line code needs no stack map table
    assert!(code.attributes.is_empty());
}

#[test]
fn pool_fills_in_first_reference_order() {
    let mut pool = ConstantPool::new();
    let assembler = MethodAssembler::new(&mut pool, Vec::new(), None).unwrap();
    assembler.assemble(&hello_world_body()).unwrap();

    // "Code" first (assembler construction), the ldc string during
    // preprocessing, then the member references in encode order
    assert_eq!(pool.len(), 15);
    assert_eq!(pool.utf8("Code").unwrap(), 1);
    assert_eq!(pool.utf8("Hello, World!").unwrap(), 2);
    assert_eq!(pool.string("Hello, World!").unwrap(), 3);
    assert_eq!(pool.class("java/lang/System").unwrap(), 5);
    assert_eq!(
        pool.field_ref("java/lang/System", "out", "Ljava/io/PrintStream;")
            .unwrap(),
        9,
    );
    assert_eq!(pool.class("java/io/PrintStream").unwrap(), 11);
    assert_eq!(
        pool.method_ref("java/io/PrintStream", "println", "(Ljava/lang/String;)V", false)
            .unwrap(),
        15,
    );
    // everything above was already interned
    assert_eq!(pool.len(), 15);
}

#[test]
fn whole_class_serializes() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut pool = ConstantPool::new();
    let assembler = MethodAssembler::new(
        &mut pool,
        vec![VerificationType::Object("[Ljava/lang/String;".to_owned())],
        None,
    )
    .unwrap();
    let code = assembler.assemble(&hello_world_body()).unwrap();
    let main = Method::new(
        &mut pool,
        MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
        "main",
        "([Ljava/lang/String;)V",
        Some(code),
    )
    .unwrap();

    let mut class = ClassFile::new(
        Version::JAVA8,
        pool,
        ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
        "Main",
        "java/lang/Object",
    )
    .unwrap();
    class.methods.push(main);

    let mut bytes = Vec::new();
    class.write(&mut bytes).unwrap();

    assert_eq!(&bytes[..4], [0xca, 0xfe, 0xba, 0xbe]);
    // minor 0, major 52
    assert_eq!(&bytes[4..8], [0, 0, 0, 52]);
    // the method body bytes appear verbatim inside the Code attribute
    let body: &[u8] = &[0xb2, 0x00, 0x09, 0x12, 0x03, 0xb6, 0x00, 0x0f, 0xb1];
    assert!(bytes.windows(body.len()).any(|window| window == body));
}

#[test]
fn serialized_pool_starts_with_slot_count() {
    let mut pool = ConstantPool::new();
    let assembler = MethodAssembler::new(&mut pool, Vec::new(), None).unwrap();
    assembler.assemble(&hello_world_body()).unwrap();

    let mut bytes = Vec::new();
    pool.serialize(&mut bytes).unwrap();
    // constant_pool_count is the next free index: 15 entries, no wide ones
    assert_eq!(&bytes[..2], [0, 16]);
    // first entry: Utf8 "Code"
    assert_eq!(&bytes[2..9], [1, 0, 4, b'C', b'o', b'd', b'e']);
}
