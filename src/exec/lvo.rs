//! Library vector offsets.
//!
//! Each emulated library fills its negative jump table with a unique A-line
//! opcode followed by RTS; the trap handler resolves the opcode back to
//! (library, offset) and then to a [`Vector`] here. An offset that carries a
//! trap but no vector mapping is a protocol violation: the handler called
//! something the bridge does not model.

/// The libraries the kernel exposes. Everything else fails to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lib {
    Exec,
    Dos,
    Utility,
}

impl Lib {
    /// Bytes of negative jump table to populate with traps.
    pub fn lvo_span(self) -> u32 {
        match self {
            Lib::Exec => 750,
            Lib::Dos => 990,
            Lib::Utility => 246,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vector {
    // exec.library
    Disable,
    Enable,
    Forbid,
    Permit,
    AllocMem,
    FreeMem,
    AvailMem,
    AddHead,
    AddTail,
    Remove,
    RemHead,
    RemTail,
    Enqueue,
    FindName,
    FindTask,
    SetSignal,
    Wait,
    Signal,
    AllocSignal,
    FreeSignal,
    AddPort,
    RemPort,
    PutMsg,
    GetMsg,
    ReplyMsg,
    WaitPort,
    FindPort,
    OldOpenLibrary,
    CloseLibrary,
    OpenLibrary,
    OpenDevice,
    CloseDevice,
    DoIO,
    SendIO,
    CheckIO,
    WaitIO,
    AbortIO,
    RawDoFmt,
    TypeOfMem,
    InitSemaphore,
    ObtainSemaphore,
    ReleaseSemaphore,
    AttemptSemaphore,
    CopyMem,
    CopyMemQuick,
    CacheClearU,
    CreateIORequest,
    DeleteIORequest,
    CreateMsgPort,
    DeleteMsgPort,
    AllocVec,
    FreeVec,
    // dos.library
    IoErr,
    DateStamp,
    Delay,
    // utility.library
    FindTagItem,
    GetTagData,
    Amiga2Date,
    Date2Amiga,
    SMult32,
    UMult32,
    SDivMod32,
    UDivMod32,
    Stricmp,
    Strnicmp,
    ToUpper,
    ToLower,
}

/// Resolve a (library, LVO offset) pair. Offsets are negative.
pub fn vector_for(lib: Lib, offset: i32) -> Option<Vector> {
    use Vector::*;
    match lib {
        Lib::Exec => match offset {
            -120 => Some(Disable),
            -126 => Some(Enable),
            -132 => Some(Forbid),
            -138 => Some(Permit),
            -198 => Some(AllocMem),
            -210 => Some(FreeMem),
            -216 => Some(AvailMem),
            -240 => Some(AddHead),
            -246 => Some(AddTail),
            -252 => Some(Remove),
            -258 => Some(RemHead),
            -264 => Some(RemTail),
            -270 => Some(Enqueue),
            -276 => Some(FindName),
            -294 => Some(FindTask),
            -306 => Some(SetSignal),
            -318 => Some(Wait),
            -324 => Some(Signal),
            -330 => Some(AllocSignal),
            -336 => Some(FreeSignal),
            -354 => Some(AddPort),
            -360 => Some(RemPort),
            -366 => Some(PutMsg),
            -372 => Some(GetMsg),
            -378 => Some(ReplyMsg),
            -384 => Some(WaitPort),
            -390 => Some(FindPort),
            -408 => Some(OldOpenLibrary),
            -414 => Some(CloseLibrary),
            -444 => Some(OpenDevice),
            -450 => Some(CloseDevice),
            -456 => Some(DoIO),
            -462 => Some(SendIO),
            -468 => Some(CheckIO),
            -474 => Some(WaitIO),
            -480 => Some(AbortIO),
            -522 => Some(RawDoFmt),
            -534 => Some(TypeOfMem),
            -552 => Some(OpenLibrary),
            -558 => Some(InitSemaphore),
            -564 => Some(ObtainSemaphore),
            -570 => Some(ReleaseSemaphore),
            -576 => Some(AttemptSemaphore),
            -624 => Some(CopyMem),
            -630 => Some(CopyMemQuick),
            -636 => Some(CacheClearU),
            -654 => Some(CreateIORequest),
            -660 => Some(DeleteIORequest),
            -666 => Some(CreateMsgPort),
            -672 => Some(DeleteMsgPort),
            -684 => Some(AllocVec),
            -690 => Some(FreeVec),
            _ => None,
        },
        Lib::Dos => match offset {
            -132 => Some(IoErr),
            -192 => Some(DateStamp),
            -198 => Some(Delay),
            _ => None,
        },
        Lib::Utility => match offset {
            -30 => Some(FindTagItem),
            -36 => Some(GetTagData),
            -120 => Some(Amiga2Date),
            -126 => Some(Date2Amiga),
            -138 => Some(SMult32),
            -144 => Some(UMult32),
            -162 => Some(SDivMod32),
            -168 => Some(UDivMod32),
            -174 => Some(Stricmp),
            -180 => Some(Strnicmp),
            -186 => Some(ToUpper),
            -192 => Some(ToLower),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_exec_vectors_resolve() {
        assert_eq!(vector_for(Lib::Exec, -198), Some(Vector::AllocMem));
        assert_eq!(vector_for(Lib::Exec, -366), Some(Vector::PutMsg));
        assert_eq!(vector_for(Lib::Exec, -456), Some(Vector::DoIO));
    }

    #[test]
    fn unknown_offsets_are_none() {
        assert_eq!(vector_for(Lib::Exec, -30), None); // Supervisor
        assert_eq!(vector_for(Lib::Dos, -30), None); // Open
    }

    #[test]
    fn offsets_are_multiples_of_six() {
        for off in (6..=750).step_by(6) {
            // Resolving must never panic across the populated span.
            let _ = vector_for(Lib::Exec, -off);
        }
    }
}
