//! Handle registry and reference-count behavior across object families.

use clmetal::cl::*;
use clmetal::object::{downcast, release_handle, retain_handle, ClObject};
use clmetal::{CommandQueue, Context, Event, Memory, Program};

#[test]
fn test_downcast_rejects_cross_family_handles() {
    let Ok(context) = Context::new() else {
        println!("no device, skipping");
        return;
    };

    let program = Program::new(&context);

    // A context handle is not a program handle, and vice versa.
    assert_eq!(
        downcast::<Program>(context.as_ptr() as *const Program).err(),
        Some(CL_INVALID_PROGRAM)
    );
    assert_eq!(
        downcast::<Context>(program.as_ptr() as *const Context).err(),
        Some(CL_INVALID_CONTEXT)
    );

    // The right family resolves.
    assert!(downcast::<Program>(program.as_ptr()).is_ok());
}

#[test]
fn test_retain_release_through_handles() {
    let Ok(context) = Context::new() else {
        println!("no device, skipping");
        return;
    };

    let raw = Program::new(&context).into_raw();

    retain_handle(raw).unwrap();
    retain_handle(raw).unwrap();
    assert_eq!(downcast::<Program>(raw).unwrap().base().ref_count(), 3);

    release_handle(raw).unwrap();
    release_handle(raw).unwrap();
    assert_eq!(downcast::<Program>(raw).unwrap().base().ref_count(), 1);

    // Last release destroys; the handle is dead afterwards.
    release_handle(raw).unwrap();
}

#[test]
fn test_descendants_keep_context_alive() {
    let Ok(context) = Context::new() else {
        println!("no device, skipping");
        return;
    };

    let before = context.base().ref_count();
    let queue = CommandQueue::new(&context, 0).unwrap();
    let memory = Memory::new_buffer(&context, 0, 64, std::ptr::null_mut()).unwrap();
    let event = Event::new_user(&context);
    let program = Program::new(&context);

    assert_eq!(context.base().ref_count(), before + 4);

    drop(queue);
    drop(memory);
    drop(event);
    drop(program);
    assert_eq!(context.base().ref_count(), before);
}
